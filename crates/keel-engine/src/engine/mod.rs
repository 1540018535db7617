use crate::bus::EventBus;
use crate::continuation::ContinuationDispatcher;
use crate::heartbeat::HeartbeatMonitor;
use crate::lifecycle::{RunLifecycle, RunOutcome, TransitionError};
use crate::reattach::AttachError;
use crate::store::EventStore;
use keel_contract::{EmitError, RunExecutor, RunRecord, RunStorage, StorageError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod builder;
mod submit;

pub use builder::{EngineBuildError, EngineBuilder};

/// Errors surfaced by the engine's client operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A task submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub thread_id: String,
    /// Opaque task payload handed through to the executor.
    pub payload: Value,
    pub correlation_id: Option<String>,
    /// How long the caller is willing to block; the engine default
    /// applies when unset. Expiry defers the run, it never cancels it.
    pub wait_timeout: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(thread_id: impl Into<String>, payload: Value) -> Self {
        Self {
            thread_id: thread_id.into(),
            payload,
            correlation_id: None,
            wait_timeout: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = Some(wait_timeout);
        self
    }
}

/// How a submission resolved within the caller's wait window.
#[derive(Debug)]
pub enum Submitted {
    /// The run went terminal while the caller was still waiting.
    Finished(RunRecord),
    /// The wait window elapsed; the run continues in the background and
    /// can be watched via `stream` or polled via `get_status`.
    Deferred { run_id: String },
}

pub(crate) struct EngineConfig {
    pub default_wait: Duration,
    pub hard_timeout: Option<Duration>,
}

/// The run-execution engine: accepts task submissions, drives them
/// through an executor, and keeps a durable, replayable event log per
/// run.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Engine {
    pub(crate) storage: Arc<dyn RunStorage>,
    pub(crate) executor: Arc<dyn RunExecutor>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) events: Arc<EventStore>,
    pub(crate) lifecycle: Arc<RunLifecycle>,
    pub(crate) heartbeats: Arc<HeartbeatMonitor>,
    pub(crate) continuations: Arc<ContinuationDispatcher>,
    /// Live cancellation tokens, one per in-flight run.
    pub(crate) tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    /// Callers blocked in a submit wait, keyed by run id.
    pub(crate) waiters: Arc<Mutex<HashMap<String, oneshot::Sender<RunOutcome>>>>,
    pub(crate) config: Arc<EngineConfig>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Event store handle, for emitting engine-adjacent events outside
    /// an execution context.
    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// Heartbeat observability handle.
    pub fn heartbeats(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeats
    }
}

pub(crate) fn generate_run_id() -> String {
    Uuid::now_v7().simple().to_string()
}
