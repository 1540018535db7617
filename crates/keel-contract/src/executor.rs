use super::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Errors from [`EventSink::emit`].
#[derive(Debug, Error)]
pub enum EmitError {
    /// Payload is not representable in the durable format; nothing was
    /// written.
    #[error("payload not representable: {0}")]
    Validation(String),

    /// Durable write failed; the event did not happen.
    #[error("event append failed: {0}")]
    Storage(#[from] StorageError),
}

/// Durable emission seam handed to executors.
///
/// Every observable step of an execution goes through `emit`; the
/// returned sequence is assigned atomically by the durable log.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<Sequence, EmitError>;
}

/// Everything an executor needs for one execution attempt.
pub struct ExecutionContext {
    pub run_id: String,
    pub thread_id: String,
    /// Opaque task payload; the engine never inspects it.
    pub payload: Value,
    pub events: Arc<dyn EventSink>,
    /// Cancelled only by the explicit cancellation path; a caller
    /// abandoning its wait never touches this token.
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Emit one observable step for this run.
    pub async fn emit(&self, event_type: &str, payload: Value) -> Result<Sequence, EmitError> {
        self.events.emit(&self.run_id, event_type, payload).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Errors an executor may surface to the engine.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Emit(#[from] EmitError),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The execution collaborator: performs the actual work of a run and
/// reports observable steps through the [`EventSink`].
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutorError>;
}
