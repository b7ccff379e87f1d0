use std::collections::HashMap;
use std::time::Duration;

use taskq::config::Config;
use taskq::config::secrets::ExposeSecret;

fn load(vars: &[(&str, &str)]) -> taskq::Result<Config> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|name| vars.get(name).cloned())
}

#[test]
fn config_loads_required_fields_with_defaults() {
    let config = load(&[("DATABASE_URL", "postgres://localhost/taskq")]).unwrap();

    assert_eq!(config.database_url.expose_secret(), "postgres://localhost/taskq");
    assert_eq!(config.queues, vec!["default"]);
    assert!(config.concurrency >= 1);
    assert_eq!(config.soft_time_limit, Duration::from_secs(1500));
    assert_eq!(config.hard_time_limit, Duration::from_secs(1800));
    assert_eq!(config.result_expires, Duration::from_secs(3600));
    assert_eq!(config.broker_max_retries, 10);
    assert_eq!(config.log_level, "info");
    assert!(config.otel_endpoint.is_none());
    assert!(config.schedule_path.is_none());
}

#[test]
fn config_fails_without_database_url() {
    assert!(load(&[]).is_err());
    assert!(load(&[("DATABASE_URL", "   ")]).is_err());
}

#[test]
fn overrides_flow_into_worker_config() {
    let config = load(&[
        ("DATABASE_URL", "postgres://x"),
        ("TASKQ_QUEUES", "high, default ,"),
        ("TASKQ_CONCURRENCY", "8"),
        ("TASKQ_WORKER_NAME", "w-1"),
        ("TASKQ_SOFT_TIME_LIMIT", "20"),
        ("TASKQ_HARD_TIME_LIMIT", "30"),
        ("TASKQ_RESULT_EXPIRES", "60"),
    ])
    .unwrap();
    assert_eq!(config.queues, vec!["high", "default"]);

    let worker = config.worker_config();
    assert_eq!(worker.worker_id, "w-1");
    assert_eq!(worker.concurrency, 8);
    assert_eq!(worker.queues, vec!["high", "default"]);
    assert_eq!(worker.soft_time_limit, Duration::from_secs(20));
    assert_eq!(worker.hard_time_limit, Duration::from_secs(30));
    assert_eq!(worker.revoke_memory, Duration::from_secs(60));
}

#[test]
fn worker_name_defaults_to_generated_id() {
    let config = load(&[("DATABASE_URL", "postgres://x")]).unwrap();
    assert!(config.worker_config().worker_id.starts_with("worker-"));
}

#[test]
fn broker_retries_shape_backoff() {
    let config = load(&[
        ("DATABASE_URL", "postgres://x"),
        ("TASKQ_BROKER_MAX_RETRIES", "3"),
    ])
    .unwrap();
    assert_eq!(config.backoff().max_retries, 3);
}

#[test]
fn malformed_values_are_rejected() {
    assert!(load(&[("DATABASE_URL", "x"), ("TASKQ_CONCURRENCY", "many")]).is_err());
    assert!(load(&[("DATABASE_URL", "x"), ("TASKQ_CONCURRENCY", "0")]).is_err());
    assert!(load(&[("DATABASE_URL", "x"), ("TASKQ_QUEUES", " , ")]).is_err());
    assert!(
        load(&[
            ("DATABASE_URL", "x"),
            ("TASKQ_SOFT_TIME_LIMIT", "10"),
            ("TASKQ_HARD_TIME_LIMIT", "5"),
        ])
        .is_err()
    );
}
