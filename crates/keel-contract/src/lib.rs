//! Run-execution contract: the persisted data model, the storage
//! traits an engine runs against, and the executor collaborator seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod executor;
mod traits;
mod types;

pub use executor::{EmitError, EventSink, ExecutionContext, ExecutorError, RunExecutor};
pub use traits::{EventLog, RunStorage, RunStore};
pub use types::{EventRecord, RunFilter, RunRecord, RunStatus, Sequence, StorageError};
