use crate::log::{Log, PersistenceFlags};
use async_trait::async_trait;
use std::collections::HashSet;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Log has no usable payload")]
    EmptyPayload,

    #[error("Storage capacity of {capacity} records exceeded and nothing can be evicted")]
    CapacityExceeded { capacity: usize },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Result of claiming the next batch of logs for a group.
#[derive(Debug, Clone, Default)]
pub struct LoadedBatch {
    /// Generated id for the claimed logs; None when nothing was claimed
    pub batch_id: Option<String>,
    pub logs: Vec<Log>,
    /// More unclaimed logs remain beyond this batch
    pub has_more: bool,
}

impl LoadedBatch {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Durable persistence for enqueued logs, partitioned by group id.
///
/// Logs are claimed into batches by `load_batch`; a claimed log is never
/// handed out again until its batch is released or deleted. Claims live in
/// memory, so every persisted log is eligible again after a restart.
///
/// Implementations must be internally thread-safe: several channel groups may
/// share one storage.
#[async_trait]
pub trait LogStorage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Persist one log. Fails with `EmptyPayload` if the log carries nothing
    /// to send, and with `CapacityExceeded` if no room can be made for it.
    async fn save_log(
        &self,
        log: &Log,
        group_id: &str,
        flags: PersistenceFlags,
    ) -> Result<(), StorageError>;

    /// Claim up to `limit` unclaimed logs of the group, oldest first, skipping
    /// logs whose target key is in `excluded_target_keys`.
    async fn load_batch(
        &self,
        group_id: &str,
        limit: usize,
        excluded_target_keys: &HashSet<String>,
    ) -> Result<LoadedBatch, StorageError>;

    /// Delete the logs claimed by a batch. Unknown batch ids delete nothing.
    async fn delete_batch(&self, group_id: &str, batch_id: &str) -> Result<usize, StorageError>;

    /// Drop the claim on a batch without deleting its logs.
    async fn release_batch(&self, group_id: &str, batch_id: &str) -> Result<(), StorageError>;

    /// Delete every log of the group, claimed or not, returning what was deleted.
    async fn delete_all(&self, group_id: &str) -> Result<Vec<Log>, StorageError>;

    async fn count_logs(&self, group_id: &str) -> Result<usize, StorageError>;

    /// Set the maximum number of stored records, evicting immediately if
    /// the store is already over. Returns the number of evicted records.
    async fn set_capacity(&self, max_records: usize) -> Result<usize, StorageError>;
}

/// Validate a log and produce its persisted form.
pub(crate) fn encode_log(log: &Log) -> Result<String, StorageError> {
    if log.payload.is_null() {
        return Err(StorageError::EmptyPayload);
    }
    let encoded = serde_json::to_string(log)?;
    if encoded.is_empty() {
        return Err(StorageError::EmptyPayload);
    }
    Ok(encoded)
}

pub(crate) fn new_batch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
