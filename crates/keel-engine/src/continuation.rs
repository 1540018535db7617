use keel_contract::{RunRecord, RunStatus};
use serde_json::{json, Value};
use std::collections::HashSet;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Exactly-once gate for completion handling and follow-up dispatch.
///
/// Completion signals can arrive more than once for the same run (the
/// execution task and a racing cancel, retried finish paths). The first
/// caller to claim a run's completion owns it; everyone else backs off.
/// The follow-up run for a deferred finish is created under that claim,
/// so duplicates can never dispatch a second continuation.
///
/// A claim is released once the terminal state is durable; finishers
/// re-read the record after claiming, so a re-claimed duplicate backs
/// off and the set stays bounded by in-flight completions.
#[derive(Default)]
pub struct ContinuationDispatcher {
    claimed: Mutex<HashSet<String>>,
}

impl ContinuationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the completion of `run_id`. Returns true for the
    /// first caller only.
    pub async fn claim_completion(&self, run_id: &str) -> bool {
        self.claimed.lock().await.insert(run_id.to_string())
    }

    /// Give the claim back after a finish attempt that did not persist,
    /// so a later signal can retry.
    pub async fn release(&self, run_id: &str) {
        self.claimed.lock().await.remove(run_id);
    }

    /// Build the follow-up run for a finished deferred run. The parent
    /// task travels along with a description of what triggered the
    /// continuation.
    pub fn follow_up(parent: &RunRecord) -> RunRecord {
        let trigger = match parent.status {
            RunStatus::Succeeded => json!({
                "status": parent.status,
                "result": parent.result.clone().unwrap_or(Value::Null),
            }),
            _ => json!({
                "status": parent.status,
                "error": parent.error.clone().unwrap_or(Value::Null.to_string()),
            }),
        };
        let payload = json!({
            "task": parent.payload.clone(),
            "trigger": trigger,
        });

        let id = Uuid::now_v7().simple().to_string();
        let mut run = RunRecord::new(id, &parent.thread_id, payload)
            .with_continuation_of(&parent.id);
        run.correlation_id = parent.correlation_id.clone();
        run
    }
}
