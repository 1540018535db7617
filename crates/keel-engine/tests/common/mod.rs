use async_trait::async_trait;
use keel_contract::{
    ExecutionContext, ExecutorError, RunExecutor, RunFilter, RunRecord, RunStore,
};
use keel_engine::Engine;
use keel_store_adapters::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Emits `steps` events spaced `step_every` apart, then succeeds.
/// Cooperative with cancellation between steps.
pub struct PacedExecutor {
    pub steps: u32,
    pub step_every: Duration,
    pub result: Value,
}

#[async_trait]
impl RunExecutor for PacedExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutorError> {
        for n in 1..=self.steps {
            tokio::time::sleep(self.step_every).await;
            if ctx.is_cancelled() {
                return Err(ExecutorError::failed("stopped by cancellation"));
            }
            ctx.emit("step", json!({ "n": n })).await?;
        }
        Ok(self.result.clone())
    }
}

/// Never finishes on its own; returns only once cancelled.
pub struct BlockedExecutor;

#[async_trait]
impl RunExecutor for BlockedExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, ExecutorError> {
        ctx.cancellation.cancelled().await;
        Err(ExecutorError::failed("stopped by cancellation"))
    }
}

pub fn engine_with(executor: Arc<dyn RunExecutor>) -> (Engine, Arc<MemoryStore>) {
    let storage = Arc::new(MemoryStore::new());
    let engine = Engine::builder()
        .storage(storage.clone())
        .executor(executor)
        .build()
        .unwrap();
    (engine, storage)
}

/// Poll until the run reaches a terminal status.
pub async fn wait_terminal(engine: &Engine, run_id: &str) -> RunRecord {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let run = engine.get_status(run_id).await.unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run did not finish")
}

/// Every run in storage, terminal ones included.
pub async fn all_runs(storage: &Arc<MemoryStore>) -> Vec<RunRecord> {
    storage.list_runs(&RunFilter::default()).await.unwrap()
}

/// Continuations of the given parent run.
pub async fn continuations_of(storage: &Arc<MemoryStore>, parent: &str) -> Vec<RunRecord> {
    all_runs(storage)
        .await
        .into_iter()
        .filter(|r| r.continuation_of.as_deref() == Some(parent))
        .collect()
}

/// Poll until at least one continuation of `parent` exists. Dispatch
/// happens just after the parent's terminal status becomes visible.
pub async fn wait_for_continuations(storage: &Arc<MemoryStore>, parent: &str) -> Vec<RunRecord> {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let children = continuations_of(storage, parent).await;
            if !children.is_empty() {
                return children;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no continuation dispatched")
}
