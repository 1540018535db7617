use async_trait::async_trait;
use chrono::Utc;
use keel_contract::{
    EventLog, EventRecord, RunFilter, RunRecord, RunStore, Sequence, StorageError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Default)]
struct EventLane {
    events: Vec<EventRecord>,
}

/// In-memory storage for testing and local development.
///
/// Event appends take a per-run lane mutex, so sequence assignment is
/// serialized within a run and concurrent across runs.
#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<String, RunRecord>>,
    lanes: RwLock<HashMap<String, Arc<Mutex<EventLane>>>>,
    next_event_id: AtomicU64,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn lane(&self, run_id: &str) -> Arc<Mutex<EventLane>> {
        if let Some(lane) = self.lanes.read().await.get(run_id) {
            return lane.clone();
        }
        let mut lanes = self.lanes.write().await;
        lanes.entry(run_id.to_string()).or_default().clone()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StorageError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(StorageError::AlreadyExists(run.id.clone()));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let runs = self.runs.read().await;
        Ok(runs.get(run_id).cloned())
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), StorageError> {
        let mut runs = self.runs.write().await;
        if !runs.contains_key(&run.id) {
            return Err(StorageError::NotFound(run.id.clone()));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StorageError> {
        let runs = self.runs.read().await;
        let mut out: Vec<RunRecord> = runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<EventRecord, StorageError> {
        if !self.runs.read().await.contains_key(run_id) {
            return Err(StorageError::NotFound(run_id.to_string()));
        }
        let lane = self.lane(run_id).await;
        let mut lane = lane.lock().await;
        let sequence = lane.events.last().map_or(0, |event| event.sequence) + 1;
        let record = EventRecord {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1,
            run_id: run_id.to_string(),
            sequence,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        };
        lane.events.push(record.clone());
        Ok(record)
    }

    async fn events_after(
        &self,
        run_id: &str,
        after: Sequence,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let Some(lane) = self.lanes.read().await.get(run_id).cloned() else {
            return Ok(Vec::new());
        };
        let lane = lane.lock().await;
        Ok(lane
            .events
            .iter()
            .filter(|event| event.sequence > after)
            .cloned()
            .collect())
    }

    async fn last_sequence(&self, run_id: &str) -> Result<Sequence, StorageError> {
        let Some(lane) = self.lanes.read().await.get(run_id).cloned() else {
            return Ok(0);
        };
        let lane = lane.lock().await;
        Ok(lane.events.last().map_or(0, |event| event.sequence))
    }
}
