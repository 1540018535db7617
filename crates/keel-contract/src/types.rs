use super::*;

/// Monotonically increasing per-run event position.
pub type Sequence = u64;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up.
    Queued,
    /// Execution in flight.
    Running,
    /// The caller stopped waiting; execution continues in the background.
    Deferred,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Deferred => "deferred",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable execution attempt of a task.
///
/// Exactly one terminal status is ever reached per run id, at most
/// once; `Deferred` is reachable only from `Running` and only through
/// the caller-side wait-timeout path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    /// Groups related runs across continuations.
    pub thread_id: String,
    pub status: RunStatus,
    /// Run this one continues, if it was auto-dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Opaque task payload handed to the executor.
    pub payload: Value,
    /// Terminal outcome payload, present once `Succeeded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(id: impl Into<String>, thread_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            status: RunStatus::Queued,
            continuation_of: None,
            correlation_id: None,
            payload,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_continuation_of(mut self, run_id: impl Into<String>) -> Self {
        self.continuation_of = Some(run_id.into());
        self
    }
}

/// An immutable, sequenced record of something that happened during a
/// run. `(run_id, sequence)` is unique; sequences are assigned
/// atomically at append time and strictly increase per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Global monotonic id, assigned by the storage engine.
    pub id: u64,
    pub run_id: String,
    pub sequence: Sequence,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Statuses to include. Empty means every status.
    pub statuses: Vec<RunStatus>,
    /// Restrict to a single thread.
    pub thread_id: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, run: &RunRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&run.status) {
            return false;
        }
        if let Some(ref thread_id) = self.thread_id {
            if run.thread_id != *thread_id {
                return false;
            }
        }
        true
    }
}

/// Storage errors shared by the run table and the event log.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Run not found.
    #[error("run not found: {0}")]
    NotFound(String),

    /// Run already exists (for create operations).
    #[error("run already exists: {0}")]
    AlreadyExists(String),

    /// Invalid run ID (path traversal, control chars, etc.).
    #[error("invalid run id: {0}")]
    InvalidId(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}
