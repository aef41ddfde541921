use super::traits::{encode_log, new_batch_id, LoadedBatch, LogStorage, StorageError};
use crate::log::{Log, LogPriority, PersistenceFlags};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

struct StoredRow {
    group_id: String,
    target_key: Option<String>,
    priority: LogPriority,
    log: Log,
}

struct BatchClaim {
    group_id: String,
    row_ids: Vec<u64>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<u64, StoredRow>,
    claims: HashMap<String, BatchClaim>,
    claimed: HashSet<u64>,
    capacity: Option<usize>,
    next_id: u64,
}

impl Inner {
    /// Oldest row of the lowest priority class not above `ceiling`.
    fn eviction_candidate(&self, ceiling: LogPriority) -> Option<u64> {
        self.rows
            .iter()
            .filter(|(_, row)| row.priority <= ceiling)
            .min_by_key(|(id, row)| (row.priority, **id))
            .map(|(id, _)| *id)
    }

    fn evict(&mut self, row_id: u64) {
        if let Some(row) = self.rows.remove(&row_id) {
            tracing::debug!(
                group_id = %row.group_id,
                log_type = %row.log.log_type,
                "Evicted log to respect storage capacity"
            );
        }
        if self.claimed.remove(&row_id) {
            for claim in self.claims.values_mut() {
                claim.row_ids.retain(|id| *id != row_id);
            }
        }
    }
}

/// Non-durable storage backed by a map; used by tests and as a fallback
/// when no database path is configured.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_records: usize) -> Self {
        let storage = Self::default();
        if let Ok(mut inner) = storage.inner.lock() {
            inner.capacity = Some(max_records);
        }
        storage
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Total number of stored records across all groups
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogStorage for InMemoryStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn save_log(
        &self,
        log: &Log,
        group_id: &str,
        flags: PersistenceFlags,
    ) -> Result<(), StorageError> {
        encode_log(log)?;
        let priority = flags.priority();
        let mut inner = self.lock()?;

        if let Some(capacity) = inner.capacity {
            while inner.rows.len() >= capacity {
                match inner.eviction_candidate(priority) {
                    Some(row_id) => inner.evict(row_id),
                    None => return Err(StorageError::CapacityExceeded { capacity }),
                }
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.rows.insert(
            id,
            StoredRow {
                group_id: group_id.to_string(),
                target_key: log.target_key().map(|k| k.to_string()),
                priority,
                log: log.clone(),
            },
        );
        Ok(())
    }

    async fn load_batch(
        &self,
        group_id: &str,
        limit: usize,
        excluded_target_keys: &HashSet<String>,
    ) -> Result<LoadedBatch, StorageError> {
        let mut inner = self.lock()?;

        let mut eligible = inner
            .rows
            .iter()
            .filter(|(id, row)| {
                row.group_id == group_id
                    && !inner.claimed.contains(id)
                    && row
                        .target_key
                        .as_ref()
                        .map_or(true, |key| !excluded_target_keys.contains(key))
            })
            .map(|(id, row)| (*id, row.log.clone()));

        let mut row_ids = Vec::new();
        let mut logs = Vec::new();
        for (id, log) in eligible.by_ref().take(limit) {
            row_ids.push(id);
            logs.push(log);
        }
        let has_more = eligible.next().is_some();

        if logs.is_empty() {
            return Ok(LoadedBatch::empty());
        }

        let batch_id = new_batch_id();
        inner.claimed.extend(row_ids.iter().copied());
        inner.claims.insert(
            batch_id.clone(),
            BatchClaim {
                group_id: group_id.to_string(),
                row_ids,
            },
        );

        Ok(LoadedBatch {
            batch_id: Some(batch_id),
            logs,
            has_more,
        })
    }

    async fn delete_batch(&self, group_id: &str, batch_id: &str) -> Result<usize, StorageError> {
        let mut inner = self.lock()?;
        let claim = match inner.claims.remove(batch_id) {
            Some(claim) if claim.group_id == group_id => claim,
            Some(claim) => {
                inner.claims.insert(batch_id.to_string(), claim);
                return Ok(0);
            }
            None => return Ok(0),
        };

        let mut deleted = 0;
        for row_id in claim.row_ids {
            inner.claimed.remove(&row_id);
            if inner.rows.remove(&row_id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn release_batch(&self, group_id: &str, batch_id: &str) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        if inner
            .claims
            .get(batch_id)
            .is_some_and(|claim| claim.group_id == group_id)
        {
            if let Some(claim) = inner.claims.remove(batch_id) {
                for row_id in claim.row_ids {
                    inner.claimed.remove(&row_id);
                }
            }
        }
        Ok(())
    }

    async fn delete_all(&self, group_id: &str) -> Result<Vec<Log>, StorageError> {
        let mut inner = self.lock()?;
        let row_ids: Vec<u64> = inner
            .rows
            .iter()
            .filter(|(_, row)| row.group_id == group_id)
            .map(|(id, _)| *id)
            .collect();

        let mut deleted = Vec::with_capacity(row_ids.len());
        for row_id in row_ids {
            inner.claimed.remove(&row_id);
            if let Some(row) = inner.rows.remove(&row_id) {
                deleted.push(row.log);
            }
        }
        inner.claims.retain(|_, claim| claim.group_id != group_id);
        Ok(deleted)
    }

    async fn count_logs(&self, group_id: &str) -> Result<usize, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.group_id == group_id)
            .count())
    }

    async fn set_capacity(&self, max_records: usize) -> Result<usize, StorageError> {
        let mut inner = self.lock()?;
        inner.capacity = Some(max_records);

        let mut evicted = 0;
        while inner.rows.len() > max_records {
            match inner.eviction_candidate(LogPriority::Critical) {
                Some(row_id) => {
                    inner.evict(row_id);
                    evicted += 1;
                }
                None => break,
            }
        }
        Ok(evicted)
    }
}
