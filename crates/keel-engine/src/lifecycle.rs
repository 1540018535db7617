use chrono::Utc;
use keel_contract::{RunFilter, RunRecord, RunStatus, RunStorage, StorageError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Terminal outcome of an execution attempt.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success(Value),
    Failure(String),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Success(_) => RunStatus::Succeeded,
            Self::Failure(_) => RunStatus::Failed,
        }
    }
}

/// What a transition request actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Status changed; carries the status the run moved from.
    Changed { from: RunStatus },
    /// The run was already in the requested terminal status; no-op.
    AlreadyTerminal,
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    Invalid {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Owns run records and enforces the state-transition table. The only
/// component that mutates a run's status.
///
/// Allowed: Queued->Running, Running->Deferred (wait-timeout path
/// only), Running->terminal, Deferred->terminal. Re-reporting the same
/// terminal status is an idempotent no-op.
pub struct RunLifecycle {
    storage: Arc<dyn RunStorage>,
    // Serializes read-modify-write of run records so racing completion
    // signals resolve to exactly one applied transition.
    write_lock: Mutex<()>,
}

impl RunLifecycle {
    pub fn new(storage: Arc<dyn RunStorage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a run in `Queued` state.
    pub async fn create_run(&self, run: RunRecord) -> Result<RunRecord, TransitionError> {
        self.storage.insert_run(&run).await?;
        tracing::debug!(run_id = %run.id, thread_id = %run.thread_id, "run created");
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, TransitionError> {
        Ok(self.storage.get_run(run_id).await?)
    }

    /// Runs matching the given statuses; empty means every non-terminal
    /// status.
    pub async fn list_active(
        &self,
        statuses: &[RunStatus],
    ) -> Result<Vec<RunRecord>, TransitionError> {
        let statuses = if statuses.is_empty() {
            vec![RunStatus::Queued, RunStatus::Running, RunStatus::Deferred]
        } else {
            statuses.to_vec()
        };
        Ok(self
            .storage
            .list_runs(&RunFilter {
                statuses,
                thread_id: None,
            })
            .await?)
    }

    /// Queued -> Running, at executor pickup.
    pub async fn mark_running(&self, run_id: &str) -> Result<Applied, TransitionError> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load(run_id).await?;
        if run.status != RunStatus::Queued {
            return Err(self.invalid(&run, RunStatus::Running));
        }
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.storage.update_run(&run).await?;
        tracing::debug!(run_id, "run picked up");
        Ok(Applied::Changed {
            from: RunStatus::Queued,
        })
    }

    /// Running -> Deferred. Reserved for the wait-timeout path; the
    /// executor never initiates this.
    pub(crate) async fn defer(&self, run_id: &str) -> Result<Applied, TransitionError> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(self.invalid(&run, RunStatus::Deferred));
        }
        run.status = RunStatus::Deferred;
        self.storage.update_run(&run).await?;
        tracing::info!(run_id, "caller stopped waiting; run deferred");
        Ok(Applied::Changed {
            from: RunStatus::Running,
        })
    }

    /// {Running, Deferred} -> terminal. Re-reporting the same terminal
    /// status on an already-terminal run is a no-op.
    pub async fn complete(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
    ) -> Result<Applied, TransitionError> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.load(run_id).await?;
        let to = outcome.status();

        if run.status.is_terminal() {
            if run.status == to {
                return Ok(Applied::AlreadyTerminal);
            }
            return Err(self.invalid(&run, to));
        }
        if !matches!(run.status, RunStatus::Running | RunStatus::Deferred) {
            return Err(self.invalid(&run, to));
        }

        let from = run.status;
        run.status = to;
        run.finished_at = Some(Utc::now());
        match outcome {
            RunOutcome::Success(result) => run.result = Some(result.clone()),
            RunOutcome::Failure(error) => run.error = Some(error.clone()),
        }
        self.storage.update_run(&run).await?;
        tracing::info!(run_id, from = %from, to = %to, "run finished");
        Ok(Applied::Changed { from })
    }

    async fn load(&self, run_id: &str) -> Result<RunRecord, TransitionError> {
        self.storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| TransitionError::NotFound(run_id.to_string()))
    }

    fn invalid(&self, run: &RunRecord, to: RunStatus) -> TransitionError {
        TransitionError::Invalid {
            run_id: run.id.clone(),
            from: run.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store_adapters::MemoryStore;
    use serde_json::json;

    async fn lifecycle_with(run_id: &str) -> RunLifecycle {
        let lifecycle = RunLifecycle::new(Arc::new(MemoryStore::new()));
        lifecycle
            .create_run(RunRecord::new(run_id, "thread-1", json!({})))
            .await
            .unwrap();
        lifecycle
    }

    #[tokio::test]
    async fn happy_path_sets_timestamps() {
        let lifecycle = lifecycle_with("run-1").await;

        lifecycle.mark_running("run-1").await.unwrap();
        let run = lifecycle.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        lifecycle
            .complete("run-1", &RunOutcome::Success(json!({"ok": true})))
            .await
            .unwrap();
        let run = lifecycle.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.result, Some(json!({"ok": true})));
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn deferred_is_reachable_only_from_running() {
        let lifecycle = lifecycle_with("run-1").await;
        assert!(matches!(
            lifecycle.defer("run-1").await,
            Err(TransitionError::Invalid { .. })
        ));

        lifecycle.mark_running("run-1").await.unwrap();
        assert_eq!(
            lifecycle.defer("run-1").await.unwrap(),
            Applied::Changed {
                from: RunStatus::Running
            }
        );

        // A deferred run can still finish.
        lifecycle
            .complete("run-1", &RunOutcome::Failure("boom".to_string()))
            .await
            .unwrap();
        let run = lifecycle.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn completing_a_queued_run_is_invalid() {
        let lifecycle = lifecycle_with("run-1").await;
        assert!(matches!(
            lifecycle
                .complete("run-1", &RunOutcome::Success(json!(null)))
                .await,
            Err(TransitionError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_is_reached_at_most_once() {
        let lifecycle = lifecycle_with("run-1").await;
        lifecycle.mark_running("run-1").await.unwrap();
        lifecycle
            .complete("run-1", &RunOutcome::Success(json!(1)))
            .await
            .unwrap();

        // Same terminal status again: idempotent no-op.
        assert_eq!(
            lifecycle
                .complete("run-1", &RunOutcome::Success(json!(2)))
                .await
                .unwrap(),
            Applied::AlreadyTerminal
        );
        let run = lifecycle.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.result, Some(json!(1)));

        // A different terminal status is rejected.
        assert!(matches!(
            lifecycle
                .complete("run-1", &RunOutcome::Failure("late".to_string()))
                .await,
            Err(TransitionError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let lifecycle = RunLifecycle::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            lifecycle.mark_running("ghost").await,
            Err(TransitionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_active_defaults_to_non_terminal() {
        let lifecycle = RunLifecycle::new(Arc::new(MemoryStore::new()));
        for id in ["a", "b", "c"] {
            lifecycle
                .create_run(RunRecord::new(id, "t", json!({})))
                .await
                .unwrap();
        }
        lifecycle.mark_running("b").await.unwrap();
        lifecycle.mark_running("c").await.unwrap();
        lifecycle
            .complete("c", &RunOutcome::Success(json!(null)))
            .await
            .unwrap();

        let active = lifecycle.list_active(&[]).await.unwrap();
        let ids: Vec<_> = active.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let running = lifecycle.list_active(&[RunStatus::Running]).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "b");
    }
}
