//! taskq CLI: run workers and the scheduler, submit and manage tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use taskq::broker::BrokerClient;
use taskq::config::Config;
use taskq::control::ControlPlane;
use taskq::db::Db;
use taskq::health;
use taskq::model::{NewTask, State, TaskId};
use taskq::registry::TaskRegistry;
use taskq::scheduler::{ScheduleTable, Scheduler, SchedulerConfig};
use taskq::telemetry::{TelemetryConfig, init_telemetry};
use taskq::{TaskClient, Worker, tasks};

#[derive(Parser)]
#[command(name = "taskq", about = "At-least-once distributed task execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker consuming the configured queues
    Worker {
        /// Override TASKQ_QUEUES (comma separated)
        #[arg(long, value_delimiter = ',')]
        queues: Option<Vec<String>>,
        /// Override TASKQ_CONCURRENCY
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run the periodic scheduler
    Beat {
        /// Periodic job table (defaults to TASKQ_SCHEDULE)
        #[arg(long)]
        schedule: Option<PathBuf>,
        /// Seconds between ticks
        #[arg(long, default_value_t = 1.0)]
        tick: f64,
    },
    /// Submit a task
    Submit {
        /// Registered task name
        name: String,
        /// Positional arguments as a JSON array
        #[arg(long)]
        args: Option<String>,
        /// Keyword arguments as a JSON object
        #[arg(long)]
        kwargs: Option<String>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Seconds to wait before the first delivery
        #[arg(long)]
        countdown: Option<f64>,
        /// Poll until the task finishes and print its status
        #[arg(long)]
        wait: bool,
    },
    /// Show a task's status
    Status {
        /// Task id (full UUID or prefix)
        id: String,
    },
    /// List recent tasks
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Revoke a task
    Revoke {
        id: String,
        /// Stop the task if it is already running
        #[arg(long)]
        terminate: bool,
    },
    /// Ask live workers about themselves
    Inspect {
        #[command(subcommand)]
        what: InspectCommand,
        /// Seconds to wait for replies
        #[arg(long, default_value_t = 1.0, global = true)]
        timeout: f64,
    },
    /// Check broker and worker availability
    Health {
        #[arg(long, default_value_t = 1.0)]
        timeout: f64,
    },
    /// Delete expired task records
    Purge,
}

#[derive(Subcommand)]
enum InspectCommand {
    /// Tasks running on each worker
    Active,
    /// Worker descriptors and counters
    Stats,
}

struct Runtime {
    config: Config,
    db: Arc<Db>,
    broker: BrokerClient,
}

impl Runtime {
    async fn connect() -> anyhow::Result<Self> {
        let config = Config::from_env()?;
        let db = Db::connect(config.database_url.expose_secret())
            .await
            .context("connecting to Postgres")?
            .with_result_expires(config.result_expires);
        db.migrate().await?;
        let db = Arc::new(db);
        let broker = BrokerClient::new(db.clone(), config.backoff());
        Ok(Self { config, db, broker })
    }

    fn client(&self, reply_timeout: Duration) -> TaskClient {
        let control = ControlPlane::new(self.broker.clone(), self.db.clone())
            .with_reply_timeout(reply_timeout);
        TaskClient::new(self.broker.clone(), self.db.clone()).with_control(control)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Worker {
            queues,
            concurrency,
        } => cmd_worker(queues, concurrency).await,
        Command::Beat { schedule, tick } => cmd_beat(schedule, tick).await,
        Command::Submit {
            name,
            args,
            kwargs,
            queue,
            max_retries,
            countdown,
            wait,
        } => {
            let rt = Runtime::connect().await?;
            cmd_submit(&rt, name, args, kwargs, queue, max_retries, countdown, wait).await
        }
        Command::Status { id } => cmd_status(&Runtime::connect().await?, &id).await,
        Command::List { state, limit } => cmd_list(&Runtime::connect().await?, state, limit).await,
        Command::Revoke { id, terminate } => {
            cmd_revoke(&Runtime::connect().await?, &id, terminate).await
        }
        Command::Inspect { what, timeout } => {
            cmd_inspect(&Runtime::connect().await?, what, timeout).await
        }
        Command::Health { timeout } => cmd_health(&Runtime::connect().await?, timeout).await,
        Command::Purge => {
            let rt = Runtime::connect().await?;
            let purged = rt.client(Duration::from_secs(1)).purge_expired().await?;
            println!("Purged {purged} expired record(s).");
            Ok(())
        }
    }
}

async fn cmd_worker(queues: Option<Vec<String>>, concurrency: Option<usize>) -> anyhow::Result<()> {
    let rt = Runtime::connect().await?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: rt.config.otel_endpoint.clone(),
        service_name: "taskq-worker".to_string(),
        log_level: rt.config.log_level.clone(),
    })?;

    let mut registry = TaskRegistry::new();
    tasks::register_builtin(&mut registry)?;

    let mut worker_config = rt.config.worker_config();
    if let Some(queues) = queues {
        worker_config.queues = queues;
    }
    if let Some(concurrency) = concurrency {
        anyhow::ensure!(concurrency > 0, "--concurrency must be at least 1");
        worker_config.concurrency = concurrency;
    }

    let worker = Worker::new(
        worker_config,
        rt.broker.clone(),
        rt.db.clone(),
        Arc::new(registry),
    );

    let shutdown = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested, finishing in-flight tasks");
        shutdown.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_beat(schedule: Option<PathBuf>, tick: f64) -> anyhow::Result<()> {
    let rt = Runtime::connect().await?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: rt.config.otel_endpoint.clone(),
        service_name: "taskq-beat".to_string(),
        log_level: rt.config.log_level.clone(),
    })?;

    let path = schedule
        .or_else(|| rt.config.schedule_path.clone())
        .context("no schedule file: pass --schedule or set TASKQ_SCHEDULE")?;
    let table = ScheduleTable::load(&path)
        .with_context(|| format!("loading schedule from {}", path.display()))?;
    let tick_interval = positive_seconds("--tick", tick)?;
    let config = SchedulerConfig {
        tick_interval,
        lease_ttl: (tick_interval * 5).max(Duration::from_secs(5)),
        ..SchedulerConfig::default()
    };
    let mut scheduler = Scheduler::new(
        config,
        table,
        rt.broker.clone(),
        rt.db.clone(),
        rt.db.clone(),
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.cancel();
    });

    scheduler.run(shutdown).await?;
    Ok(())
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: Option<String>, what: &str) -> anyhow::Result<Option<T>> {
    raw.map(|json| serde_json::from_str(&json).with_context(|| format!("--{what} is not valid JSON")))
        .transpose()
}

/// A non-negative, finite number of seconds.
fn seconds_arg(flag: &str, seconds: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(seconds).with_context(|| format!("{flag} {seconds} is not a valid number of seconds"))
}

fn positive_seconds(flag: &str, seconds: f64) -> anyhow::Result<Duration> {
    let duration = seconds_arg(flag, seconds)?;
    anyhow::ensure!(!duration.is_zero(), "{flag} must be positive");
    Ok(duration)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_submit(
    rt: &Runtime,
    name: String,
    args: Option<String>,
    kwargs: Option<String>,
    queue: Option<String>,
    max_retries: Option<u32>,
    countdown: Option<f64>,
    wait: bool,
) -> anyhow::Result<()> {
    let mut task = NewTask::new(name);
    if let Some(args) = parse_json::<Vec<Value>>(args, "args")? {
        task = task.args(args);
    }
    if let Some(kwargs) = parse_json::<Map<String, Value>>(kwargs, "kwargs")? {
        task = task.kwargs(kwargs);
    }
    if let Some(queue) = queue {
        task = task.queue(queue);
    }
    if let Some(n) = max_retries {
        task = task.max_retries(n);
    }
    if let Some(seconds) = countdown {
        task = task.countdown(seconds_arg("--countdown", seconds)?);
    }

    let client = rt.client(Duration::from_secs(1));
    let id = client.submit(task).await?;
    println!("{id}");

    if wait {
        loop {
            let status = client.get_status(id).await?;
            if status.is_ready() || status.state().is_none() {
                println!("{}", serde_json::to_string_pretty(&status.to_json())?);
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    Ok(())
}

/// Resolve a full id, or a unique prefix among recent records.
async fn resolve_id(client: &TaskClient, raw: &str) -> anyhow::Result<TaskId> {
    if let Ok(id) = raw.parse::<TaskId>() {
        return Ok(id);
    }
    let records = client.list(None, 1000).await?;
    let matches: Vec<TaskId> = records
        .iter()
        .map(|r| r.id)
        .filter(|id| id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no task matching '{raw}'"),
        [id] => Ok(*id),
        many => anyhow::bail!("{} tasks match prefix '{raw}', be more specific", many.len()),
    }
}

async fn cmd_status(rt: &Runtime, raw: &str) -> anyhow::Result<()> {
    let client = rt.client(Duration::from_secs(1));
    let id = resolve_id(&client, raw).await?;
    let status = client.get_status(id).await?;

    let Some(record) = status.record() else {
        println!("ID:         {id}");
        println!("State:      NOT_FOUND");
        return Ok(());
    };
    println!("ID:         {}", record.id);
    println!("Task:       {}", record.name);
    println!("Queue:      {}", record.queue);
    println!("State:      {}", record.state);
    println!("Attempts:   {}", record.attempts);
    println!(
        "Retries:    {}/{}",
        record.retries,
        record
            .max_retries
            .map_or_else(|| "-".to_string(), |n| n.to_string())
    );
    println!("Worker:     {}", record.worker_id.as_deref().unwrap_or("-"));
    println!("Created:    {}", record.created_at);
    println!("Updated:    {}", record.updated_at);
    println!("Expires:    {}", record.expires_at);
    if let Some(ref progress) = record.progress {
        println!("Progress:   {}", serde_json::to_string(progress)?);
    }
    if let Some(ref result) = record.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref error) = record.error {
        println!("Error:      {error}");
    }
    Ok(())
}

async fn cmd_list(rt: &Runtime, state: Option<String>, limit: usize) -> anyhow::Result<()> {
    let state: Option<State> = state.map(|s| s.parse()).transpose()?;
    let records = rt.client(Duration::from_secs(1)).list(state, limit).await?;

    if records.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<10}  {:<9}  {:<8}  UPDATED",
        "ID", "TASK", "QUEUE", "STATE", "ATTEMPTS"
    );
    println!("{}", "-".repeat(80));
    for record in &records {
        println!(
            "{:<8}  {:<20}  {:<10}  {:<9}  {:<8}  {}",
            record.id.short(),
            record.name,
            record.queue,
            record.state,
            record.attempts,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} task(s)", records.len());
    Ok(())
}

async fn cmd_revoke(rt: &Runtime, raw: &str, terminate: bool) -> anyhow::Result<()> {
    let client = rt.client(Duration::from_secs(1));
    let id = resolve_id(&client, raw).await?;
    let ack = client.revoke(id, terminate).await?;

    println!(
        "Revoked {} (state: {})",
        ack.task_id,
        ack.state.map_or("NOT_FOUND", State::as_str)
    );
    println!("Acknowledged by {} worker(s)", ack.acknowledged_by.len());
    if !ack.terminated_by.is_empty() {
        println!("Terminated on: {}", ack.terminated_by.join(", "));
    }
    Ok(())
}

async fn cmd_inspect(rt: &Runtime, what: InspectCommand, timeout: f64) -> anyhow::Result<()> {
    let client = rt.client(positive_seconds("--timeout", timeout)?);

    let output = match what {
        InspectCommand::Active => serde_json::to_value(client.control().inspect_active().await?)?,
        InspectCommand::Stats => serde_json::to_value(client.stats().await?)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_health(rt: &Runtime, timeout: f64) -> anyhow::Result<()> {
    let timeout = positive_seconds("--timeout", timeout)?;
    let client = rt.client(timeout);
    let readiness = health::readiness(&client, timeout).await;
    println!("{}", serde_json::to_string_pretty(&readiness)?);
    if !readiness.is_ready() {
        std::process::exit(1);
    }
    Ok(())
}
