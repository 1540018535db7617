use async_trait::async_trait;
use chrono::Utc;
use keel_contract::{
    EventLog, EventRecord, RunFilter, RunRecord, RunStore, Sequence, StorageError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell, RwLock};

#[derive(Default)]
struct FileLane {
    last_sequence: Option<Sequence>,
}

/// File-backed storage: one directory per run holding a `run.json`
/// document and an append-only `events.jsonl` log.
///
/// Run documents are written atomically (tmp file + rename); event
/// lines are appended and fsynced before the append is acknowledged.
pub struct FileStore {
    base_path: PathBuf,
    lanes: RwLock<HashMap<String, Arc<Mutex<FileLane>>>>,
    /// Global event id counter, recovered from the log on first append
    /// after reopen.
    next_event_id: OnceCell<AtomicU64>,
}

impl FileStore {
    /// Create a new file store rooted at the given base path.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            lanes: RwLock::new(HashMap::new()),
            next_event_id: OnceCell::new(),
        }
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, StorageError> {
        Self::validate_run_id(run_id)?;
        Ok(self.base_path.join(run_id))
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.run_dir(run_id)?.join("run.json"))
    }

    fn events_path(&self, run_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.run_dir(run_id)?.join("events.jsonl"))
    }

    /// Validate that a run ID is safe for use as a directory name.
    /// Rejects path separators, `..`, and control characters.
    fn validate_run_id(run_id: &str) -> Result<(), StorageError> {
        if run_id.is_empty() {
            return Err(StorageError::InvalidId("run id cannot be empty".to_string()));
        }
        if run_id.contains('/')
            || run_id.contains('\\')
            || run_id.contains("..")
            || run_id.contains('\0')
        {
            return Err(StorageError::InvalidId(format!(
                "run id contains invalid characters: {run_id:?}"
            )));
        }
        if run_id.chars().any(char::is_control) {
            return Err(StorageError::InvalidId(format!(
                "run id contains control characters: {run_id:?}"
            )));
        }
        Ok(())
    }

    async fn lane(&self, run_id: &str) -> Arc<Mutex<FileLane>> {
        if let Some(lane) = self.lanes.read().await.get(run_id) {
            return lane.clone();
        }
        let mut lanes = self.lanes.write().await;
        lanes.entry(run_id.to_string()).or_default().clone()
    }

    /// Allocate the next global event id, scanning existing logs once
    /// per store instance to recover `max(id) + 1`.
    async fn alloc_event_id(&self) -> Result<u64, StorageError> {
        let counter = self
            .next_event_id
            .get_or_try_init(|| async {
                let max = self.scan_max_event_id().await?;
                Ok::<_, StorageError>(AtomicU64::new(max))
            })
            .await?;
        Ok(counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn scan_max_event_id(&self) -> Result<u64, StorageError> {
        let mut max = 0;
        if !self.base_path.exists() {
            return Ok(max);
        }
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let events_path = entry.path().join("events.jsonl");
            if !events_path.exists() {
                continue;
            }
            for event in Self::read_events(&events_path).await? {
                max = max.max(event.id);
            }
        }
        Ok(max)
    }

    async fn read_events(path: &PathBuf) -> Result<Vec<EventRecord>, StorageError> {
        let content = tokio::fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .collect()
    }

    /// Write a run document atomically.
    async fn write_run(&self, run: &RunRecord) -> Result<(), StorageError> {
        let dir = self.run_dir(&run.id)?;
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        let path = self.run_path(&run.id)?;
        let content = serde_json::to_string_pretty(run)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let tmp_path = dir.join(format!(".run.{}.tmp", uuid::Uuid::now_v7().simple()));
        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            match tokio::fs::rename(&tmp_path, &path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::fs::remove_file(&path).await?;
                    tokio::fs::rename(&tmp_path, &path).await?;
                }
                Err(e) => return Err(e),
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let path = self.run_path(run_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let run =
            serde_json::from_str(&content).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(run))
    }
}

#[async_trait]
impl RunStore for FileStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<(), StorageError> {
        if self.run_path(&run.id)?.exists() {
            return Err(StorageError::AlreadyExists(run.id.clone()));
        }
        self.write_run(run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        self.read_run(run_id).await
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), StorageError> {
        if !self.run_path(&run.id)?.exists() {
            return Err(StorageError::NotFound(run.id.clone()));
        }
        self.write_run(run).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StorageError> {
        let mut out = Vec::new();
        if !self.base_path.exists() {
            return Ok(out);
        }
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(run) = self.read_run(&run_id).await? {
                if filter.matches(&run) {
                    out.push(run);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl EventLog for FileStore {
    async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<EventRecord, StorageError> {
        if !self.run_path(run_id)?.exists() {
            return Err(StorageError::NotFound(run_id.to_string()));
        }
        let lane = self.lane(run_id).await;
        let mut lane = lane.lock().await;

        let path = self.events_path(run_id)?;
        let last = match lane.last_sequence {
            Some(last) => last,
            None => {
                // First append through this lane: recover the cursor
                // from the durable log.
                if path.exists() {
                    Self::read_events(&path)
                        .await?
                        .last()
                        .map_or(0, |event| event.sequence)
                } else {
                    0
                }
            }
        };

        let record = EventRecord {
            id: self.alloc_event_id().await?,
            run_id: run_id.to_string(),
            sequence: last + 1,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        };
        let line =
            serde_json::to_string(&record).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_data().await?;

        lane.last_sequence = Some(record.sequence);
        Ok(record)
    }

    async fn events_after(
        &self,
        run_id: &str,
        after: Sequence,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let path = self.events_path(run_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(Self::read_events(&path)
            .await?
            .into_iter()
            .filter(|event| event.sequence > after)
            .collect())
    }
}
