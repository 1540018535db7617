use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Last-observed-activity tracking per run.
///
/// Staleness is an observability signal only. Nothing in the engine
/// transitions or cancels a run because heartbeats went missing; the
/// only force-stop mechanism is the explicit cancellation path (which
/// the hard-timeout safety net also uses).
#[derive(Default)]
pub struct HeartbeatMonitor {
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event type counts as a heartbeat. Heartbeats are
    /// regular durable events; they additionally reset staleness.
    pub fn is_heartbeat_class(event_type: &str) -> bool {
        event_type == "heartbeat" || event_type.starts_with("heartbeat.")
    }

    /// Record activity for a run.
    pub async fn mark_activity(&self, run_id: &str) {
        self.last_seen
            .lock()
            .await
            .insert(run_id.to_string(), Instant::now());
    }

    pub async fn last_activity(&self, run_id: &str) -> Option<Instant> {
        self.last_seen.lock().await.get(run_id).copied()
    }

    /// Whether the run has gone quiet for longer than `soft_threshold`.
    ///
    /// A run that never produced a heartbeat is not considered stale;
    /// the signal only becomes meaningful once activity has been seen.
    pub async fn is_stale(&self, run_id: &str, soft_threshold: Duration) -> bool {
        match self.last_activity(run_id).await {
            Some(seen) => seen.elapsed() >= soft_threshold,
            None => false,
        }
    }

    /// Drop bookkeeping for a finished run.
    pub async fn clear(&self, run_id: &str) {
        self.last_seen.lock().await.remove(run_id);
    }
}
