use keel_contract::EventRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::RwLock;

/// In-process fan-out of freshly appended events to attached listeners.
///
/// Liveness only, never a source of truth: each run gets a bounded
/// broadcast channel, publishing never blocks, and a subscriber that
/// falls behind loses the oldest buffered items and observes the loss
/// as a lag signal so it can re-sync from the durable log.
///
/// One instance per process, constructed at startup and passed by
/// reference into the components that need it.
pub struct EventBus {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<EventRecord>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to live events for a run, creating the channel on
    /// demand. Each receiver owns an independent bounded buffer.
    pub async fn subscribe(&self, run_id: &str) -> broadcast::Receiver<Arc<EventRecord>> {
        if let Some(tx) = self.channels.read().await.get(run_id) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish one event to whoever is listening. Having no
    /// subscribers is not an error.
    pub async fn publish(&self, event: Arc<EventRecord>) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&event.run_id) {
            let _ = tx.send(event.clone());
        }
    }

    /// Close a run's channel once the run is terminal. Live tails see
    /// the channel close and finish from the durable log.
    pub async fn retire(&self, run_id: &str) {
        self.channels.write().await.remove(run_id);
    }

    /// Drop every channel; part of process shutdown.
    pub async fn shutdown(&self) {
        self.channels.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::broadcast::error::RecvError;

    fn event(run_id: &str, sequence: u64) -> Arc<EventRecord> {
        Arc::new(EventRecord {
            id: sequence,
            run_id: run_id.to_string(),
            sequence,
            event_type: "step".to_string(),
            payload: json!({ "seq": sequence }),
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(8);
        bus.publish(event("run-1", 1)).await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe("run-1").await;
        bus.publish(event("run-1", 1)).await;
        bus.publish(event("run-2", 1)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id, "run-1");
        assert_eq!(received.sequence, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_items() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("run-1").await;
        for seq in 1..=10 {
            bus.publish(event("run-1", seq)).await;
        }

        match rx.recv().await {
            Err(RecvError::Lagged(missed)) => assert_eq!(missed, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        // The oldest items were dropped; delivery resumes at the
        // earliest still-buffered event.
        assert_eq!(rx.recv().await.unwrap().sequence, 7);
    }

    #[tokio::test]
    async fn retire_closes_live_tails() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("run-1").await;
        bus.retire("run-1").await;
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn independent_subscribers_have_independent_cursors() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe("run-1").await;
        let mut b = bus.subscribe("run-1").await;
        bus.publish(event("run-1", 1)).await;

        assert_eq!(a.recv().await.unwrap().sequence, 1);
        assert_eq!(b.recv().await.unwrap().sequence, 1);
    }
}
