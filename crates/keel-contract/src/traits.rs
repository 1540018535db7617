use super::*;

/// Read/write access to the run table.
///
/// Implementations persist records verbatim; transition legality is
/// owned by the lifecycle layer, never by storage.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run. Returns `AlreadyExists` if the id is taken.
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StorageError>;

    /// Load a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError>;

    /// Replace the stored record for an existing run.
    async fn update_run(&self, run: &RunRecord) -> Result<(), StorageError>;

    /// List runs matching the filter, ordered by creation time.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StorageError>;
}

/// Append-only, per-run sequenced event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably append one event, atomically assigning
    /// `sequence = last sequence for the run + 1`.
    ///
    /// Appends for one run are serialized (single writer lane per run)
    /// but fully concurrent across distinct runs.
    async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<EventRecord, StorageError>;

    /// Events with sequence strictly greater than `after`, in strictly
    /// ascending sequence order. Repeated calls with the same arguments
    /// return the same result.
    async fn events_after(
        &self,
        run_id: &str,
        after: Sequence,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Highest sequence assigned for the run, 0 when none. Convenience
    /// wrapper; backends with an index should override it.
    async fn last_sequence(&self, run_id: &str) -> Result<Sequence, StorageError> {
        Ok(self
            .events_after(run_id, 0)
            .await?
            .last()
            .map_or(0, |event| event.sequence))
    }
}

/// Full storage capability behind a run engine.
pub trait RunStorage: RunStore + EventLog {}

impl<T: RunStore + EventLog + ?Sized> RunStorage for T {}
