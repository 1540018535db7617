use crate::bus::EventBus;
use crate::heartbeat::HeartbeatMonitor;
use async_trait::async_trait;
use keel_contract::{EmitError, EventRecord, EventSink, RunStorage, Sequence, StorageError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Append-only, per-run sequenced log of execution events; the source
/// of truth for everything that happened during a run.
///
/// Wraps the storage contract with payload validation, bus fan-out and
/// heartbeat bookkeeping. The durable write always precedes the
/// publish, and a failed write means the event did not happen.
pub struct EventStore {
    storage: Arc<dyn RunStorage>,
    bus: Arc<EventBus>,
    heartbeats: Arc<HeartbeatMonitor>,
}

impl EventStore {
    pub fn new(
        storage: Arc<dyn RunStorage>,
        bus: Arc<EventBus>,
        heartbeats: Arc<HeartbeatMonitor>,
    ) -> Self {
        Self {
            storage,
            bus,
            heartbeats,
        }
    }

    /// Durably record one event and fan it out to live listeners.
    /// Returns the sequence assigned by the log.
    pub async fn emit(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<Sequence, EmitError> {
        // Reject unrepresentable payloads before anything is written.
        validate_payload(&payload)?;

        let record = self.storage.append_event(run_id, event_type, payload).await?;
        tracing::trace!(
            run_id,
            seq = record.sequence,
            event_type,
            "event appended"
        );

        if HeartbeatMonitor::is_heartbeat_class(event_type) {
            self.heartbeats.mark_activity(run_id).await;
        }
        // Publish only after the durable write; no subscribers is fine.
        self.bus.publish(Arc::new(record.clone())).await;
        Ok(record.sequence)
    }

    /// Emit an arbitrary serializable payload; serialization failures
    /// surface as validation errors before any write.
    pub async fn emit_serialized<T: Serialize>(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &T,
    ) -> Result<Sequence, EmitError> {
        let value =
            serde_json::to_value(payload).map_err(|e| EmitError::Validation(e.to_string()))?;
        self.emit(run_id, event_type, value).await
    }

    /// Deterministic historical replay: events with sequence strictly
    /// greater than `after`, ascending.
    pub async fn query(
        &self,
        run_id: &str,
        after: Sequence,
    ) -> Result<Vec<EventRecord>, StorageError> {
        self.storage.events_after(run_id, after).await
    }
}

#[async_trait]
impl EventSink for EventStore {
    async fn emit(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<Sequence, EmitError> {
        EventStore::emit(self, run_id, event_type, payload).await
    }
}

fn validate_payload(payload: &Value) -> Result<(), EmitError> {
    // serde_json refuses structures nested past its recursion limit;
    // catching that here keeps the log free of half-written rows.
    serde_json::to_string(payload).map_err(|e| EmitError::Validation(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_contract::RunRecord;
    use keel_store_adapters::MemoryStore;
    use serde_json::json;

    async fn store_with_run(run_id: &str) -> (Arc<EventBus>, EventStore) {
        let storage = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(16));
        let events = EventStore::new(
            storage.clone(),
            bus.clone(),
            Arc::new(HeartbeatMonitor::new()),
        );
        keel_contract::RunStore::insert_run(
            storage.as_ref(),
            &RunRecord::new(run_id, "thread-1", json!({})),
        )
        .await
        .unwrap();
        (bus, events)
    }

    #[tokio::test]
    async fn emit_appends_then_publishes() {
        let (bus, events) = store_with_run("run-1").await;
        let mut rx = bus.subscribe("run-1").await;

        let seq = events.emit("run-1", "step", json!({"n": 1})).await.unwrap();
        assert_eq!(seq, 1);
        let seq = events.emit("run-1", "step", json!({"n": 2})).await.unwrap();
        assert_eq!(seq, 2);

        let replay = events.query("run-1", 0).await.unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].sequence, 1);

        // Live delivery carries the durably assigned sequence.
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn oversized_nesting_is_rejected_before_write() {
        let (_bus, events) = store_with_run("run-1").await;

        let mut nested = json!(1);
        for _ in 0..200 {
            nested = json!([nested]);
        }
        assert!(matches!(
            events.emit("run-1", "step", nested).await,
            Err(EmitError::Validation(_))
        ));
        assert!(events.query("run-1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unserializable_payload_is_rejected_before_write() {
        let (_bus, events) = store_with_run("run-1").await;

        let mut bad_keys = std::collections::HashMap::new();
        bad_keys.insert((1u8, 2u8), "x");
        assert!(matches!(
            events.emit_serialized("run-1", "step", &bad_keys).await,
            Err(EmitError::Validation(_))
        ));
        assert!(events.query("run-1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn emit_to_unknown_run_is_a_storage_error() {
        let storage: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let events = EventStore::new(
            storage,
            Arc::new(EventBus::new(16)),
            Arc::new(HeartbeatMonitor::new()),
        );
        assert!(matches!(
            events.emit("ghost", "step", json!(null)).await,
            Err(EmitError::Storage(StorageError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn heartbeats_reset_staleness_other_events_do_not() {
        let storage = Arc::new(MemoryStore::new());
        let heartbeats = Arc::new(HeartbeatMonitor::new());
        let events = EventStore::new(
            storage.clone(),
            Arc::new(EventBus::new(16)),
            heartbeats.clone(),
        );
        keel_contract::RunStore::insert_run(
            storage.as_ref(),
            &RunRecord::new("run-1", "t", json!({})),
        )
        .await
        .unwrap();

        events.emit("run-1", "step", json!({})).await.unwrap();
        assert!(heartbeats.last_activity("run-1").await.is_none());

        events.emit("run-1", "heartbeat", json!({})).await.unwrap();
        assert!(heartbeats.last_activity("run-1").await.is_some());
    }
}
