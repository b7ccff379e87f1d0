//! Tasks: messages on the wire, lifecycle state, and the persisted record.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::payload::TaskPayload;

/// Queue used when the submitter does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Retry ceiling when neither the message nor the registration sets one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Task Id
// ---------------------------------------------------------------------------

/// Identity of a logical task. Retries keep the id; nothing else reuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for log lines and tables.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Submitted, not yet picked up.
    Pending,
    /// Dequeued by a worker.
    Received,
    /// Handler invoked.
    Started,
    /// Handler reported partial status.
    Progress,
    /// Re-published with a countdown, waiting for redelivery.
    Retry,
    /// Handler returned a value. Terminal.
    Success,
    /// Handler failed, timed out, was terminated or ran out of retries. Terminal.
    Failure,
    /// Cancelled before it started. Terminal.
    Revoked,
}

impl State {
    pub const ALL: [State; 8] = [
        State::Pending,
        State::Received,
        State::Started,
        State::Progress,
        State::Retry,
        State::Success,
        State::Failure,
        State::Revoked,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Received)
                | (Pending, Revoked)
                | (Received, Started)
                | (Received, Failure)   // unknown task
                | (Received, Revoked)
                | (Received, Received)  // redelivered before the handler started
                | (Started, Progress)
                | (Started, Success)
                | (Started, Failure)
                | (Started, Retry)
                | (Started, Received)   // redelivered after a worker crash
                | (Progress, Progress)
                | (Progress, Success)
                | (Progress, Failure)
                | (Progress, Retry)
                | (Progress, Received)
                | (Retry, Received)
                | (Retry, Revoked)
        )
    }

    /// States from which `to` may be entered.
    pub fn sources_of(to: State) -> Vec<State> {
        State::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failure | State::Revoked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "PENDING",
            State::Received => "RECEIVED",
            State::Started => "STARTED",
            State::Progress => "PROGRESS",
            State::Retry => "RETRY",
            State::Success => "SUCCESS",
            State::Failure => "FAILURE",
            State::Revoked => "REVOKED",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::error::Error::Other(format!("unknown state: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Task Message
// ---------------------------------------------------------------------------

/// Routing and retry metadata carried with every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHeaders {
    /// Retries already spent on this task.
    pub retries: u32,
    /// Retry ceiling. None defers to the handler's registration.
    pub max_retries: Option<u32>,
    /// Earliest dispatch time.
    pub eta: Option<DateTime<Utc>>,
    pub published_at: DateTime<Utc>,
}

/// A unit of work on the wire. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub headers: TaskHeaders,
    pub queue: String,
}

impl TaskMessage {
    /// The message a retry re-publishes: same task, one more retry, later eta.
    pub fn for_retry(&self, countdown: Duration, now: DateTime<Utc>) -> TaskMessage {
        let countdown = chrono::Duration::from_std(countdown).unwrap_or(chrono::Duration::zero());
        TaskMessage {
            headers: TaskHeaders {
                retries: self.headers.retries + 1,
                max_retries: self.headers.max_retries,
                eta: Some(now + countdown),
                published_at: now,
            },
            ..self.clone()
        }
    }

    /// Whether the message may be handed to a worker at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.headers.eta.is_none_or(|eta| eta <= now)
    }

    /// Arguments as handed to the handler.
    pub fn payload(&self) -> TaskPayload {
        TaskPayload::new(self.args.clone(), self.kwargs.clone())
    }
}

// ---------------------------------------------------------------------------
// Task Error
// ---------------------------------------------------------------------------

/// Why a task ended in FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The handler returned a failure or panicked.
    Handler,
    /// Soft or hard time limit hit.
    TimeoutExceeded,
    /// Retry requested with no retries left.
    RetriesExhausted,
    /// No handler registered under the message's name.
    UnknownTask,
    /// Stopped by a revoke with terminate.
    Terminated,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskErrorKind::Handler => "Handler",
            TaskErrorKind::TimeoutExceeded => "TimeoutExceeded",
            TaskErrorKind::RetriesExhausted => "RetriesExhausted",
            TaskErrorKind::UnknownTask => "UnknownTask",
            TaskErrorKind::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Serialized failure detail stored on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Task Record
// ---------------------------------------------------------------------------

/// Mutable lifecycle state of a task, as kept by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub queue: String,
    pub state: State,
    /// Opaque handler-supplied metadata.
    pub progress: Option<Value>,
    /// Present only in SUCCESS.
    pub result: Option<Value>,
    /// Present only in FAILURE.
    pub error: Option<TaskError>,
    pub retries: u32,
    pub max_retries: Option<u32>,
    /// Number of times the handler was invoked.
    pub attempts: u32,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Field changes that ride along with a state transition.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub worker_id: Option<String>,
    pub retries: Option<u32>,
    pub max_retries: Option<u32>,
}

impl RecordPatch {
    pub fn received(worker_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            max_retries: Some(max_retries),
            ..Self::default()
        }
    }

    pub fn progress(meta: Value) -> Self {
        Self {
            progress: Some(meta),
            ..Self::default()
        }
    }

    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failure(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn retry(retries: u32) -> Self {
        Self {
            retries: Some(retries),
            ..Self::default()
        }
    }
}

impl TaskRecord {
    /// A fresh PENDING record for a message.
    pub fn pending(message: &TaskMessage, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: message.id,
            name: message.name.clone(),
            queue: message.queue.clone(),
            state: State::Pending,
            progress: None,
            result: None,
            error: None,
            retries: message.headers.retries,
            max_retries: message.headers.max_retries,
            attempts: 0,
            worker_id: None,
            created_at: now,
            updated_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    /// Apply a validated transition in place.
    ///
    /// Callers check `can_transition_to` first; this only mutates fields.
    pub fn apply(&mut self, to: State, patch: RecordPatch, now: DateTime<Utc>, ttl: Duration) {
        if to == State::Started {
            self.attempts += 1;
        }
        if let Some(progress) = patch.progress {
            self.progress = Some(progress);
        }
        self.result = if to == State::Success {
            patch.result
        } else {
            None
        };
        self.error = if to == State::Failure {
            patch.error
        } else {
            None
        };
        if let Some(worker_id) = patch.worker_id {
            self.worker_id = Some(worker_id);
        }
        if let Some(retries) = patch.retries {
            self.retries = retries;
        }
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = Some(max_retries);
        }
        self.state = to;
        self.updated_at = now;
        self.expires_at = expiry(now, ttl);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// What a status query reports. Unknown and expired ids are `NotFound`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    NotFound { task_id: TaskId },
    Known(Box<TaskRecord>),
}

impl TaskStatus {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskStatus::NotFound { task_id } => *task_id,
            TaskStatus::Known(record) => record.id,
        }
    }

    pub fn state(&self) -> Option<State> {
        match self {
            TaskStatus::NotFound { .. } => None,
            TaskStatus::Known(record) => Some(record.state),
        }
    }

    /// "NOT_FOUND" or the state name.
    pub fn state_name(&self) -> &'static str {
        self.state().map_or("NOT_FOUND", State::as_str)
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_some_and(State::is_terminal)
    }

    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            TaskStatus::NotFound { .. } => None,
            TaskStatus::Known(record) => Some(record),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.record().and_then(|r| r.result.as_ref())
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.record().and_then(|r| r.error.as_ref())
    }

    pub fn progress(&self) -> Option<&Value> {
        self.record().and_then(|r| r.progress.as_ref())
    }

    /// Flat JSON view for callers that just want to print or forward it.
    pub fn to_json(&self) -> Value {
        let ready = self.is_ready();
        serde_json::json!({
            "task_id": self.task_id().to_string(),
            "state": self.state_name(),
            "ready": ready,
            "successful": if ready { Some(self.state() == Some(State::Success)) } else { None },
            "progress": self.progress(),
            "result": self.result(),
            "error": self.error().map(|e| e.to_string()),
            "attempts": self.record().map(|r| r.attempts),
            "retries": self.record().map(|r| r.retries),
        })
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a submission. The client's public API for creating work.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) name: String,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) queue: Option<String>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) countdown: Option<Duration>,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            queue: None,
            max_retries: None,
            countdown: None,
        }
    }

    pub fn args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Delay the first delivery.
    pub fn countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stamp a fresh id and headers onto the submission.
    pub fn into_message(self, now: DateTime<Utc>) -> TaskMessage {
        let eta = self
            .countdown
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        TaskMessage {
            id: TaskId::new(),
            name: self.name,
            args: self.args,
            kwargs: self.kwargs,
            headers: TaskHeaders {
                retries: 0,
                max_retries: self.max_retries,
                eta,
                published_at: now,
            },
            queue: self.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
        }
    }
}
