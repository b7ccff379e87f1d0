//! End-to-end tests for workers, retries, revocation, and scheduling on the
//! in-process backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use taskq::backoff::BackoffPolicy;
use taskq::broker::{Broker, BrokerClient};
use taskq::control::ControlPlane;
use taskq::memory::{MemoryBroker, MemoryStore};
use taskq::model::{NewTask, RecordPatch, State, TaskErrorKind, TaskId, TaskStatus};
use taskq::registry::{TaskOptions, TaskRegistry};
use taskq::scheduler::{PeriodicJob, Schedule, ScheduleTable, Scheduler, SchedulerConfig};
use taskq::store::TaskStore;
use taskq::{Error, Outcome, TaskClient, TaskContext, Worker, WorkerConfig, tasks};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    client: TaskClient,
}

fn harness() -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let broker_client = BrokerClient::new(broker.clone(), BackoffPolicy::NONE);
    let control = ControlPlane::new(broker_client.clone(), store.clone())
        .with_reply_timeout(Duration::from_millis(200));
    let client = TaskClient::new(broker_client, store.clone()).with_control(control);
    Harness {
        broker,
        store,
        client,
    }
}

fn worker_config(id: &str, concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        worker_id: id.to_string(),
        concurrency,
        soft_time_limit: Duration::from_secs(5),
        hard_time_limit: Duration::from_secs(10),
        visibility_grace: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
        housekeeping_interval: Duration::from_secs(1),
        ..WorkerConfig::default()
    }
}

/// Spawn a worker and wait until it answers control pings.
async fn start_worker(
    h: &Harness,
    config: WorkerConfig,
    registry: TaskRegistry,
) -> (Worker, JoinHandle<taskq::Result<()>>) {
    let worker = Worker::new(
        config,
        BrokerClient::new(h.broker.clone(), BackoffPolicy::NONE),
        h.store.clone(),
        Arc::new(registry),
    );
    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let replies = h
            .client
            .control()
            .ping(Duration::from_millis(50))
            .await
            .unwrap();
        if replies.iter().any(|id| id == worker.id()) {
            break;
        }
        assert!(Instant::now() < deadline, "worker {} never came up", worker.id());
    }
    (worker, handle)
}

async fn stop(worker: Worker, handle: JoinHandle<taskq::Result<()>>) {
    worker.shutdown();
    handle.await.unwrap().unwrap();
}

async fn wait_until_ready(client: &TaskClient, id: TaskId) -> TaskStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = client.get_status(id).await.unwrap();
        if status.is_ready() {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "task {id} stuck in {}",
            status.state_name()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_state(client: &TaskClient, id: TaskId, state: State) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while client.get_status(id).await.unwrap().state() != Some(state) {
        assert!(Instant::now() < deadline, "task {id} never reached {state}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    tasks::register_builtin(&mut registry).unwrap();
    registry
}

type Invocations = Arc<Mutex<HashMap<TaskId, u32>>>;

fn counting_registry(seen: &Invocations) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    let seen = seen.clone();
    registry
        .register_fn("count", move |_payload, ctx: TaskContext| {
            let seen = seen.clone();
            async move {
                *seen.lock().entry(ctx.task_id()).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
                Outcome::success(())
            }
        })
        .unwrap();
    registry
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_numbers_yields_eight() {
    let h = harness();
    let (worker, handle) = start_worker(&h, worker_config("w1", 2), builtin_registry()).await;

    let id = h
        .client
        .submit(NewTask::new("add_numbers").args([5, 3]))
        .await
        .unwrap();
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Success));
    assert_eq!(status.result(), Some(&json!(8)));
    let record = status.record().unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.worker_id.as_deref(), Some("w1"));
    assert_eq!(worker.stats().processed.get("add_numbers"), Some(&1));

    stop(worker, handle).await;
    assert_eq!(h.broker.depth("default").outstanding(), 0);
}

#[tokio::test]
async fn status_right_after_submit_is_pending_or_later() {
    let h = harness();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), builtin_registry()).await;

    let id = h
        .client
        .submit(NewTask::new("add_numbers").args([1, 2]))
        .await
        .unwrap();
    let status = h.client.get_status(id).await.unwrap();
    assert!(status.state().is_some(), "fresh submission reported NOT_FOUND");

    wait_until_ready(&h.client, id).await;
    stop(worker, handle).await;
}

#[tokio::test]
async fn progress_is_kept_on_the_record() {
    let h = harness();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), builtin_registry()).await;

    let id = h
        .client
        .submit(
            NewTask::new("long_running_task")
                .kwarg("duration", 3)
                .kwarg("step_ms", 20),
        )
        .await
        .unwrap();
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Success));
    assert_eq!(status.progress().unwrap()["current"], 3);
    assert_eq!(status.result().unwrap()["duration"], 3);
    stop(worker, handle).await;
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fail_fail_succeed_ends_in_success_after_three_attempts() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("flaky", |_payload, ctx: TaskContext| async move {
            if ctx.retries() < 2 {
                ctx.request_retry(Duration::from_millis(10));
                return Outcome::failure("not yet");
            }
            Outcome::success(ctx.attempt())
        })
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), registry).await;

    let id = h
        .client
        .submit(NewTask::new("flaky").max_retries(3))
        .await
        .unwrap();
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Success));
    let record = status.record().unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(record.retries, 2);
    assert_eq!(status.result(), Some(&json!(3)));
    stop(worker, handle).await;
}

#[tokio::test]
async fn endless_retries_end_in_retries_exhausted() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("hopeless", |_payload, ctx: TaskContext| async move {
            ctx.request_retry(Duration::from_millis(10))
        })
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), registry).await;

    let id = h
        .client
        .submit(NewTask::new("hopeless").max_retries(2))
        .await
        .unwrap();
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Failure));
    assert_eq!(status.error().unwrap().kind, TaskErrorKind::RetriesExhausted);
    let record = status.record().unwrap();
    assert_eq!(record.retries, 2);
    assert_eq!(record.attempts, 3);
    stop(worker, handle).await;
    assert_eq!(h.broker.depth("default").outstanding(), 0);
}

#[tokio::test]
async fn builtin_retry_task_uses_its_registered_ceiling() {
    let h = harness();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), builtin_registry()).await;

    let id = h
        .client
        .submit(
            NewTask::new("task_with_retry")
                .kwarg("should_fail", true)
                .kwarg("countdown_ms", 10),
        )
        .await
        .unwrap();
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Success));
    assert_eq!(status.result().unwrap()["attempts"], 3);
    assert_eq!(status.record().unwrap().max_retries, Some(3));
    stop(worker, handle).await;
}

// ---------------------------------------------------------------------------
// Failures and time limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_task_fails_and_is_rejected() {
    let h = harness();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), builtin_registry()).await;

    let id = h.client.submit(NewTask::new("no_such_task")).await.unwrap();
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Failure));
    assert_eq!(status.error().unwrap().kind, TaskErrorKind::UnknownTask);
    assert_eq!(status.record().unwrap().attempts, 0);
    stop(worker, handle).await;

    let archived = h.broker.archived("default");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, id);
}

#[tokio::test]
async fn panic_is_recorded_as_handler_failure() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("explode", |_payload, _ctx: TaskContext| async move {
            if Utc::now().timestamp() > 0 {
                panic!("kaboom");
            }
            Outcome::success(())
        })
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), registry).await;

    let id = h.client.submit(NewTask::new("explode")).await.unwrap();
    let status = wait_until_ready(&h.client, id).await;

    let error = status.error().unwrap();
    assert_eq!(error.kind, TaskErrorKind::Handler);
    assert!(error.message.contains("kaboom"));
    stop(worker, handle).await;
    assert_eq!(h.broker.depth("default").outstanding(), 0);
}

#[tokio::test]
async fn soft_limit_lets_handler_clean_up() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn_with(
            "cooperative",
            TaskOptions::default()
                .soft_time_limit(Duration::from_millis(50))
                .hard_time_limit(Duration::from_secs(5)),
            |_payload, ctx: TaskContext| async move {
                ctx.cancelled().await;
                assert!(ctx.soft_limit_exceeded());
                Outcome::failure("cleaned up")
            },
        )
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), registry).await;

    let id = h.client.submit(NewTask::new("cooperative")).await.unwrap();
    let status = wait_until_ready(&h.client, id).await;

    let error = status.error().unwrap();
    assert_eq!(error.kind, TaskErrorKind::TimeoutExceeded);
    assert_eq!(error.message, "cleaned up");
    stop(worker, handle).await;
}

#[tokio::test]
async fn hard_limit_stops_handler() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn_with(
            "stuck",
            TaskOptions::default()
                .soft_time_limit(Duration::from_millis(50))
                .hard_time_limit(Duration::from_millis(150)),
            |_payload, _ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Outcome::success(())
            },
        )
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), registry).await;

    let started = Instant::now();
    let id = h.client.submit(NewTask::new("stuck")).await.unwrap();
    let status = wait_until_ready(&h.client, id).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(status.state(), Some(State::Failure));
    assert_eq!(status.error().unwrap().kind, TaskErrorKind::TimeoutExceeded);
    assert!(worker.active_tasks().is_empty());
    stop(worker, handle).await;
    assert_eq!(h.broker.depth("default").outstanding(), 0);
}

// ---------------------------------------------------------------------------
// Revocation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn revoke_while_pending_prevents_start() {
    let h = harness();
    let seen: Invocations = Arc::default();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), counting_registry(&seen)).await;

    let id = h
        .client
        .submit(NewTask::new("count").countdown(Duration::from_millis(150)))
        .await
        .unwrap();
    let ack = h.client.revoke(id, false).await.unwrap();
    assert_eq!(ack.state, Some(State::Revoked));
    assert_eq!(ack.acknowledged_by, vec!["w1".to_string()]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.broker.depth("default").outstanding() > 0 {
        assert!(Instant::now() < deadline, "revoked message never consumed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = h.client.get_status(id).await.unwrap();
    assert_eq!(status.state(), Some(State::Revoked));
    assert_eq!(status.record().unwrap().attempts, 0);
    assert!(seen.lock().is_empty());
    stop(worker, handle).await;
}

#[tokio::test]
async fn revoke_with_terminate_stops_running_task() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("sleepy", |_payload, _ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Outcome::success(())
        })
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), registry).await;

    let id = h.client.submit(NewTask::new("sleepy")).await.unwrap();
    wait_for_state(&h.client, id, State::Started).await;

    let ack = h.client.revoke(id, true).await.unwrap();
    assert_eq!(ack.state, Some(State::Started));
    assert_eq!(ack.terminated_by, vec!["w1".to_string()]);

    let status = wait_until_ready(&h.client, id).await;
    assert_eq!(status.state(), Some(State::Failure));
    assert_eq!(status.error().unwrap().kind, TaskErrorKind::Terminated);
    stop(worker, handle).await;
}

#[tokio::test]
async fn revoke_without_terminate_lets_running_task_finish() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("brief", |_payload, _ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Outcome::success("done")
        })
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), registry).await;

    let id = h.client.submit(NewTask::new("brief")).await.unwrap();
    wait_for_state(&h.client, id, State::Started).await;

    let ack = h.client.revoke(id, false).await.unwrap();
    assert!(ack.terminated_by.is_empty());

    let status = wait_until_ready(&h.client, id).await;
    assert_eq!(status.state(), Some(State::Success));
    stop(worker, handle).await;
}

// ---------------------------------------------------------------------------
// Delivery guarantees
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tasks_spread_over_workers_run_exactly_once() {
    let h = harness();
    let seen: Invocations = Arc::default();
    let mut workers = Vec::new();
    for i in 0..3 {
        let config = worker_config(&format!("w{i}"), 2);
        workers.push(start_worker(&h, config, counting_registry(&seen)).await);
    }

    let mut ids = Vec::new();
    for _ in 0..30 {
        ids.push(h.client.submit(NewTask::new("count")).await.unwrap());
    }
    for id in &ids {
        assert_eq!(
            wait_until_ready(&h.client, *id).await.state(),
            Some(State::Success)
        );
    }

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), ids.len());
        assert!(seen.values().all(|&n| n == 1), "duplicate execution: {seen:?}");
    }
    for (worker, handle) in workers {
        stop(worker, handle).await;
    }
    assert_eq!(h.broker.depth("default").outstanding(), 0);
}

#[tokio::test]
async fn crashed_delivery_is_redelivered_and_completed() {
    let h = harness();
    let id = h
        .client
        .submit(NewTask::new("add_numbers").args([2, 2]))
        .await
        .unwrap();

    // A worker takes the message, starts it, and dies without acking.
    let lost = h
        .broker
        .fetch("default", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lost.message.id, id);
    h.store
        .transition(id, State::Received, RecordPatch::received("dead-worker", 3))
        .await
        .unwrap();
    h.store
        .transition(id, State::Started, RecordPatch::default())
        .await
        .unwrap();

    let (worker, handle) = start_worker(&h, worker_config("w1", 1), builtin_registry()).await;
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Success));
    assert_eq!(status.result(), Some(&json!(4)));
    let record = status.record().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.worker_id.as_deref(), Some("w1"));
    stop(worker, handle).await;
}

#[tokio::test]
async fn delivery_lost_before_start_is_redelivered_and_completed() {
    let h = harness();
    let id = h
        .client
        .submit(NewTask::new("add_numbers").args([2, 2]))
        .await
        .unwrap();

    // A worker takes the message, marks it received, and dies before starting.
    let lost = h
        .broker
        .fetch("default", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lost.message.id, id);
    h.store
        .transition(id, State::Received, RecordPatch::received("dead-worker", 3))
        .await
        .unwrap();

    let (worker, handle) = start_worker(&h, worker_config("w1", 1), builtin_registry()).await;
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Success));
    assert_eq!(status.result(), Some(&json!(4)));
    let record = status.record().unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.worker_id.as_deref(), Some("w1"));
    stop(worker, handle).await;
    assert_eq!(h.broker.depth("default").outstanding(), 0);
}

#[tokio::test]
async fn delivery_superseded_by_retry_is_dropped() {
    let h = harness();
    let seen: Invocations = Arc::default();

    // The first run asked for a retry: the record is in RETRY and both the
    // original message and its retry copy are in the queue.
    let message = NewTask::new("count").into_message(Utc::now());
    h.store.insert_pending(&message).await.unwrap();
    h.store
        .transition(message.id, State::Received, RecordPatch::received("w0", 3))
        .await
        .unwrap();
    h.store
        .transition(message.id, State::Started, RecordPatch::default())
        .await
        .unwrap();
    h.store
        .transition(message.id, State::Retry, RecordPatch::retry(1))
        .await
        .unwrap();
    let copy = message.for_retry(Duration::ZERO, Utc::now());
    h.broker.publish(&message).await.unwrap();
    h.broker.publish(&copy).await.unwrap();

    let (worker, handle) = start_worker(&h, worker_config("w1", 1), counting_registry(&seen)).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.broker.depth("default").outstanding() > 0 {
        assert!(Instant::now() < deadline, "messages never consumed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(seen.lock().get(&message.id), Some(&1));
    let status = h.client.get_status(message.id).await.unwrap();
    assert_eq!(status.state(), Some(State::Success));
    let record = status.record().unwrap();
    assert_eq!(record.retries, 1);
    assert_eq!(record.attempts, 2);
    stop(worker, handle).await;
}

#[tokio::test]
async fn duplicate_message_for_finished_task_is_dropped() {
    let h = harness();
    let seen: Invocations = Arc::default();
    let (worker, handle) = start_worker(&h, worker_config("w1", 1), counting_registry(&seen)).await;

    let message = NewTask::new("count").into_message(Utc::now());
    h.store.insert_pending(&message).await.unwrap();
    h.broker.publish(&message).await.unwrap();
    h.broker.publish(&message).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.broker.depth("default").outstanding() > 0 {
        assert!(Instant::now() < deadline, "messages never consumed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(seen.lock().get(&message.id), Some(&1));
    let status = h.client.get_status(message.id).await.unwrap();
    assert_eq!(status.state(), Some(State::Success));
    stop(worker, handle).await;
}

// ---------------------------------------------------------------------------
// Broker outages
// ---------------------------------------------------------------------------

fn fast_backoff(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

/// Visibility timeout of 300ms, so lost deliveries come back quickly.
fn short_visibility_config(id: &str) -> WorkerConfig {
    WorkerConfig {
        soft_time_limit: Duration::from_millis(100),
        hard_time_limit: Duration::from_millis(200),
        visibility_grace: Duration::from_millis(100),
        ..worker_config(id, 1)
    }
}

/// `outage` takes the broker down during the first run, which then either
/// asks for a retry or succeeds. Later runs succeed.
fn outage_registry(broker: &Arc<MemoryBroker>, calls: &Arc<AtomicU32>, retry_first: bool) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    let (broker, calls) = (broker.clone(), calls.clone());
    registry
        .register_fn("outage", move |_payload, ctx: TaskContext| {
            let (broker, calls) = (broker.clone(), calls.clone());
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    broker.set_available(false);
                    if retry_first {
                        return ctx.request_retry(Duration::from_millis(10));
                    }
                }
                Outcome::success(ctx.attempt())
            }
        })
        .unwrap();
    registry
}

#[tokio::test]
async fn retry_lost_to_outage_is_rerun_from_original_delivery() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let (w1, w1_handle) = start_worker(
        &h,
        short_visibility_config("w1"),
        outage_registry(&h.broker, &calls, true),
    )
    .await;

    let id = h.client.submit(NewTask::new("outage")).await.unwrap();

    let err = w1_handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::BrokerUnavailable { .. }), "{err}");
    drop(w1);
    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.state, State::Started);
    assert_eq!(record.retries, 0);

    h.broker.set_available(true);
    let (w2, w2_handle) = start_worker(
        &h,
        short_visibility_config("w2"),
        outage_registry(&h.broker, &calls, true),
    )
    .await;
    let status = wait_until_ready(&h.client, id).await;

    assert_eq!(status.state(), Some(State::Success));
    assert_eq!(status.result(), Some(&json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    stop(w2, w2_handle).await;
    assert_eq!(h.broker.depth("default").outstanding(), 0);
}

#[tokio::test]
async fn recorded_success_is_not_rerun_when_ack_fails() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let (w1, w1_handle) = start_worker(
        &h,
        short_visibility_config("w1"),
        outage_registry(&h.broker, &calls, false),
    )
    .await;

    let id = h.client.submit(NewTask::new("outage")).await.unwrap();

    let err = w1_handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::BrokerUnavailable { .. }), "{err}");
    drop(w1);
    assert_eq!(
        h.client.get_status(id).await.unwrap().state(),
        Some(State::Success)
    );

    h.broker.set_available(true);
    let (w2, w2_handle) = start_worker(
        &h,
        short_visibility_config("w2"),
        outage_registry(&h.broker, &calls, false),
    )
    .await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.broker.depth("default").outstanding() > 0 {
        assert!(Instant::now() < deadline, "unacked delivery never came back");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let status = h.client.get_status(id).await.unwrap();
    assert_eq!(status.result(), Some(&json!(1)));
    stop(w2, w2_handle).await;
}

#[tokio::test]
async fn submit_surfaces_broker_unavailable_after_backoff() {
    let broker = Arc::new(MemoryBroker::new());
    broker.set_available(false);
    let client = TaskClient::new(
        BrokerClient::new(broker.clone(), fast_backoff(3)),
        Arc::new(MemoryStore::new()),
    );

    let err = client
        .submit(NewTask::new("add_numbers"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BrokerUnavailable { attempts: 4, .. }), "{err}");
}

#[tokio::test]
async fn submit_rides_out_a_short_outage() {
    let broker = Arc::new(MemoryBroker::new());
    broker.set_available(false);
    let client = TaskClient::new(
        BrokerClient::new(broker.clone(), fast_backoff(100)),
        Arc::new(MemoryStore::new()),
    );

    let restore = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        restore.set_available(true);
    });

    client.submit(NewTask::new("add_numbers")).await.unwrap();
    assert_eq!(broker.depth("default").ready, 1);
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inspect_reports_running_tasks_and_stats() {
    let h = harness();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("busy", |_payload, _ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Outcome::success(())
        })
        .unwrap();
    let (worker, handle) = start_worker(&h, worker_config("w1", 2), registry).await;

    let id = h.client.submit(NewTask::new("busy")).await.unwrap();
    wait_for_state(&h.client, id, State::Started).await;

    let active = h.client.list_active().await.unwrap();
    assert_eq!(active.get("w1"), Some(&vec![id]));

    let stats = h.client.stats().await.unwrap();
    let w1 = &stats["w1"];
    assert_eq!(w1.concurrency, 2);
    assert_eq!(w1.in_flight, vec![id]);
    assert_eq!(w1.queues, vec!["default".to_string()]);

    wait_until_ready(&h.client, id).await;
    assert_eq!(worker.stats().total_processed(), 1);
    stop(worker, handle).await;
}

// ---------------------------------------------------------------------------
// Periodic scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn competing_schedulers_publish_each_period_once() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();

    let mut runs = Vec::new();
    for name in ["beat-a", "beat-b"] {
        let table = ScheduleTable::new(vec![PeriodicJob::new(
            "every-200ms",
            "add_numbers",
            Schedule::every(Duration::from_millis(200)).unwrap(),
        )
        .args(vec![json!(1), json!(1)])])
        .unwrap();
        let mut scheduler = Scheduler::new(
            SchedulerConfig {
                instance_id: name.to_string(),
                tick_interval: Duration::from_millis(20),
                lease_ttl: Duration::from_secs(2),
            },
            table,
            BrokerClient::new(broker.clone(), BackoffPolicy::NONE),
            store.clone(),
            store.clone(),
        );
        let token = shutdown.clone();
        runs.push(tokio::spawn(async move { scheduler.run(token).await }));
    }

    // Five periods.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    shutdown.cancel();
    for run in runs {
        run.await.unwrap().unwrap();
    }

    let published = broker.depth("default").ready;
    assert!((4..=6).contains(&published), "published {published}");
}
