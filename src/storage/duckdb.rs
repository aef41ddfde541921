use super::traits::{encode_log, new_batch_id, LoadedBatch, LogStorage, StorageError};
use crate::log::{Log, LogPriority, PersistenceFlags};
use async_trait::async_trait;
use duckdb::Connection;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        // On non-Unix systems, assume process is running to be safe
        true
    }
}

/// Extract PID from DuckDB lock error message
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    // Error format: "... (PID 12345) ..."
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

/// Remove DuckDB WAL and lock files left behind by a crashed process
fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    let wal_path = PathBuf::from(format!("{}.wal", db_path.display()));
    let lock_path = PathBuf::from(format!("{}.lock", db_path.display()));

    if wal_path.exists() {
        std::fs::remove_file(&wal_path)?;
        tracing::info!("Removed stale WAL file: {}", wal_path.display());
    }

    if lock_path.exists() {
        std::fs::remove_file(&lock_path)?;
        tracing::info!("Removed stale lock file: {}", lock_path.display());
    }

    Ok(())
}

struct BatchClaim {
    group_id: String,
    row_ids: Vec<i64>,
}

/// Batch claims and capacity. Claims are process-local on purpose: after a
/// restart every row is eligible for batching again.
#[derive(Default)]
struct ClaimState {
    claims: HashMap<String, BatchClaim>,
    claimed: HashSet<i64>,
    capacity: Option<usize>,
}

impl ClaimState {
    fn unclaim_row(&mut self, row_id: i64) {
        if self.claimed.remove(&row_id) {
            for claim in self.claims.values_mut() {
                claim.row_ids.retain(|id| *id != row_id);
            }
        }
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock().map_err(|_| StorageError::LockPoisoned)
}

fn lock_state(state: &Mutex<ClaimState>) -> Result<MutexGuard<'_, ClaimState>, StorageError> {
    state.lock().map_err(|_| StorageError::LockPoisoned)
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::Database(format!("Task join error: {}", e))
}

fn total_rows(conn: &Connection) -> Result<usize, StorageError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Delete the oldest row of the lowest priority class not above `ceiling`.
/// Returns false if no row qualifies.
fn evict_one(
    conn: &Connection,
    state: &mut ClaimState,
    ceiling: LogPriority,
) -> Result<bool, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id FROM logs WHERE priority <= ? ORDER BY priority, id LIMIT 1",
    )?;
    let mut rows = stmt.query(duckdb::params![ceiling.as_i32()])?;

    let (row_id, group_id) = match rows.next()? {
        Some(row) => (row.get::<_, i64>(0)?, row.get::<_, String>(1)?),
        None => return Ok(false),
    };
    drop(rows);
    drop(stmt);

    conn.execute("DELETE FROM logs WHERE id = ?", duckdb::params![row_id])?;
    state.unclaim_row(row_id);
    tracing::debug!(group_id = %group_id, row_id, "Evicted log to respect storage capacity");
    Ok(true)
}

/// DuckDB implementation of the LogStorage trait
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
    state: Arc<Mutex<ClaimState>>,
}

impl DuckDbStorage {
    /// Open (or create) a DuckDB database file, recovering from a stale
    /// lock left by a process that crashed.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Database(format!(
                        "failed to create directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        match Connection::open(path) {
            Ok(conn) => Ok(Self::from_connection(conn)),
            Err(e) => {
                let error_msg = e.to_string();

                if error_msg.contains("Could not set lock") {
                    tracing::warn!("Database lock detected: {}", error_msg);

                    if let Some(pid) = extract_pid_from_lock_error(&error_msg) {
                        tracing::info!("Lock is held by PID {}, checking if process is running", pid);

                        if !is_process_running(pid) {
                            tracing::warn!("Process {} is not running, removing stale lock files", pid);

                            if let Err(io_err) = remove_lock_files(path) {
                                tracing::error!("Failed to remove lock files: {}", io_err);
                                return Err(e.into());
                            }

                            tracing::info!("Retrying database connection after removing stale locks");
                            let conn = Connection::open(path)?;
                            return Ok(Self::from_connection(conn));
                        } else {
                            tracing::error!("Process {} is still running, cannot acquire lock", pid);
                        }
                    }
                }

                Err(e.into())
            }
        }
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            state: Arc::new(Mutex::new(ClaimState::default())),
        }
    }
}

#[async_trait]
impl LogStorage for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn)?;

            conn.execute("CREATE SEQUENCE IF NOT EXISTS logs_id_seq START 1", [])?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS logs (
                    id BIGINT PRIMARY KEY DEFAULT nextval('logs_id_seq'),
                    group_id VARCHAR NOT NULL,
                    target_key VARCHAR,
                    priority INTEGER NOT NULL,
                    timestamp TIMESTAMPTZ NOT NULL,
                    log VARCHAR NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_logs_group ON logs(group_id)",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn save_log(
        &self,
        log: &Log,
        group_id: &str,
        flags: PersistenceFlags,
    ) -> Result<(), StorageError> {
        let encoded = encode_log(log)?;
        let conn = self.conn.clone();
        let state = self.state.clone();
        let group_id = group_id.to_string();
        let target_key = log.target_key().map(|k| k.to_string());
        let timestamp = log.timestamp.timestamp_micros();
        let priority = flags.priority();

        tokio::task::spawn_blocking(move || {
            let mut state = lock_state(&state)?;
            let conn = lock_conn(&conn)?;

            if let Some(capacity) = state.capacity {
                let mut count = total_rows(&conn)?;
                while count >= capacity {
                    if !evict_one(&conn, &mut state, priority)? {
                        return Err(StorageError::CapacityExceeded { capacity });
                    }
                    count -= 1;
                }
            }

            conn.execute(
                "INSERT INTO logs (group_id, target_key, priority, timestamp, log)
                 VALUES (?, ?, ?, to_timestamp(? / 1000000.0), ?)",
                duckdb::params![group_id, target_key, priority.as_i32(), timestamp, encoded],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(join_error)?
    }

    async fn load_batch(
        &self,
        group_id: &str,
        limit: usize,
        excluded_target_keys: &HashSet<String>,
    ) -> Result<LoadedBatch, StorageError> {
        let conn = self.conn.clone();
        let state = self.state.clone();
        let group_id = group_id.to_string();
        let excluded = excluded_target_keys.clone();

        tokio::task::spawn_blocking(move || {
            let mut state = lock_state(&state)?;
            let conn = lock_conn(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, target_key, log FROM logs WHERE group_id = ? ORDER BY id",
            )?;
            let mut rows = stmt.query(duckdb::params![group_id])?;

            let mut row_ids = Vec::new();
            let mut logs = Vec::new();
            let mut has_more = false;

            while let Some(row) = rows.next()? {
                let row_id: i64 = row.get(0)?;
                let target_key: Option<String> = row.get(1)?;

                if state.claimed.contains(&row_id)
                    || target_key.as_ref().is_some_and(|key| excluded.contains(key))
                {
                    continue;
                }

                if logs.len() >= limit {
                    has_more = true;
                    break;
                }

                let encoded: String = row.get(2)?;
                let log: Log = serde_json::from_str(&encoded)?;
                row_ids.push(row_id);
                logs.push(log);
            }

            if logs.is_empty() {
                return Ok(LoadedBatch::empty());
            }

            let batch_id = new_batch_id();
            state.claimed.extend(row_ids.iter().copied());
            state.claims.insert(
                batch_id.clone(),
                BatchClaim {
                    group_id,
                    row_ids,
                },
            );

            Ok::<LoadedBatch, StorageError>(LoadedBatch {
                batch_id: Some(batch_id),
                logs,
                has_more,
            })
        })
        .await
        .map_err(join_error)?
    }

    async fn delete_batch(&self, group_id: &str, batch_id: &str) -> Result<usize, StorageError> {
        let conn = self.conn.clone();
        let state = self.state.clone();
        let group_id = group_id.to_string();
        let batch_id = batch_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut state = lock_state(&state)?;

            let owned = state
                .claims
                .get(&batch_id)
                .is_some_and(|claim| claim.group_id == group_id);
            if !owned {
                return Ok(0);
            }
            let claim = match state.claims.remove(&batch_id) {
                Some(claim) => claim,
                None => return Ok(0),
            };

            let conn = lock_conn(&conn)?;
            let mut deleted = 0;
            for row_id in claim.row_ids {
                state.claimed.remove(&row_id);
                deleted += conn.execute("DELETE FROM logs WHERE id = ?", duckdb::params![row_id])?;
            }

            Ok::<usize, StorageError>(deleted)
        })
        .await
        .map_err(join_error)?
    }

    async fn release_batch(&self, group_id: &str, batch_id: &str) -> Result<(), StorageError> {
        let mut state = lock_state(&self.state)?;
        let owned = state
            .claims
            .get(batch_id)
            .is_some_and(|claim| claim.group_id == group_id);
        if owned {
            if let Some(claim) = state.claims.remove(batch_id) {
                for row_id in claim.row_ids {
                    state.claimed.remove(&row_id);
                }
            }
        }
        Ok(())
    }

    async fn delete_all(&self, group_id: &str) -> Result<Vec<Log>, StorageError> {
        let conn = self.conn.clone();
        let state = self.state.clone();
        let group_id = group_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut state = lock_state(&state)?;
            let conn = lock_conn(&conn)?;

            let mut stmt = conn.prepare("SELECT id, log FROM logs WHERE group_id = ? ORDER BY id")?;
            let rows = stmt.query_map(duckdb::params![group_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut deleted = Vec::new();
            for row in rows {
                let (row_id, encoded) = row?;
                state.claimed.remove(&row_id);
                match serde_json::from_str::<Log>(&encoded) {
                    Ok(log) => deleted.push(log),
                    Err(e) => tracing::warn!(row_id, error = %e, "Deleting undecodable log"),
                }
            }
            drop(stmt);

            conn.execute("DELETE FROM logs WHERE group_id = ?", duckdb::params![group_id])?;
            state.claims.retain(|_, claim| claim.group_id != group_id);

            Ok::<Vec<Log>, StorageError>(deleted)
        })
        .await
        .map_err(join_error)?
    }

    async fn count_logs(&self, group_id: &str) -> Result<usize, StorageError> {
        let conn = self.conn.clone();
        let group_id = group_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock_conn(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE group_id = ?",
                duckdb::params![group_id],
                |row| row.get(0),
            )?;
            Ok::<usize, StorageError>(count as usize)
        })
        .await
        .map_err(join_error)?
    }

    async fn set_capacity(&self, max_records: usize) -> Result<usize, StorageError> {
        let conn = self.conn.clone();
        let state = self.state.clone();

        tokio::task::spawn_blocking(move || {
            let mut state = lock_state(&state)?;
            let conn = lock_conn(&conn)?;
            state.capacity = Some(max_records);

            let mut count = total_rows(&conn)?;
            let mut evicted = 0;
            while count > max_records && evict_one(&conn, &mut state, LogPriority::Critical)? {
                count -= 1;
                evicted += 1;
            }

            if evicted > 0 {
                tracing::info!(evicted, max_records, "Evicted logs after capacity change");
            }
            Ok::<usize, StorageError>(evicted)
        })
        .await
        .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_storage() -> DuckDbStorage {
        let storage = DuckDbStorage::in_memory().unwrap();
        storage.init_schema().await.unwrap();
        storage
    }

    fn make_log(name: &str) -> Log {
        Log::new("event", json!({ "name": name }))
    }

    #[tokio::test]
    async fn test_schema_initialization_is_repeatable() {
        let storage = DuckDbStorage::in_memory().unwrap();
        assert!(storage.init_schema().await.is_ok());
        assert!(storage.init_schema().await.is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let storage = setup_storage().await;
        let log = make_log("a").with_target_token("key-secret");
        storage
            .save_log(&log, "group", PersistenceFlags::DEFAULT)
            .await
            .unwrap();

        let batch = storage.load_batch("group", 10, &HashSet::new()).await.unwrap();
        assert_eq!(batch.logs, vec![log]);
        assert!(batch.batch_id.is_some());
        assert!(!batch.has_more);
    }

    #[tokio::test]
    async fn test_claimed_logs_are_not_loaded_twice() {
        let storage = setup_storage().await;
        for name in ["a", "b", "c"] {
            storage
                .save_log(&make_log(name), "group", PersistenceFlags::DEFAULT)
                .await
                .unwrap();
        }

        let first = storage.load_batch("group", 2, &HashSet::new()).await.unwrap();
        assert_eq!(first.logs.len(), 2);
        assert!(first.has_more);

        let second = storage.load_batch("group", 2, &HashSet::new()).await.unwrap();
        assert_eq!(second.logs.len(), 1);
        assert_eq!(second.logs[0].payload["name"], "c");
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn test_delete_and_release_batch() {
        let storage = setup_storage().await;
        for name in ["a", "b"] {
            storage
                .save_log(&make_log(name), "group", PersistenceFlags::DEFAULT)
                .await
                .unwrap();
        }

        let first = storage.load_batch("group", 1, &HashSet::new()).await.unwrap();
        let second = storage.load_batch("group", 1, &HashSet::new()).await.unwrap();

        assert_eq!(
            storage
                .delete_batch("group", first.batch_id.as_deref().unwrap())
                .await
                .unwrap(),
            1
        );
        storage
            .release_batch("group", second.batch_id.as_deref().unwrap())
            .await
            .unwrap();

        let again = storage.load_batch("group", 10, &HashSet::new()).await.unwrap();
        assert_eq!(again.logs.len(), 1);
        assert_eq!(again.logs[0].payload["name"], "b");
        assert_eq!(storage.count_logs("group").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_batch_from_other_group_is_noop() {
        let storage = setup_storage().await;
        storage
            .save_log(&make_log("a"), "group", PersistenceFlags::DEFAULT)
            .await
            .unwrap();
        let batch = storage.load_batch("group", 1, &HashSet::new()).await.unwrap();

        let deleted = storage
            .delete_batch("other", batch.batch_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(storage.count_logs("group").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capacity_prefers_evicting_normal_logs() {
        let storage = setup_storage().await;
        storage.set_capacity(2).await.unwrap();

        storage
            .save_log(&make_log("critical"), "group", PersistenceFlags::CRITICAL)
            .await
            .unwrap();
        storage
            .save_log(&make_log("old"), "group", PersistenceFlags::DEFAULT)
            .await
            .unwrap();
        storage
            .save_log(&make_log("new"), "group", PersistenceFlags::DEFAULT)
            .await
            .unwrap();

        let batch = storage.load_batch("group", 10, &HashSet::new()).await.unwrap();
        let names: Vec<_> = batch.logs.iter().map(|l| l.payload["name"].clone()).collect();
        assert_eq!(names, vec![json!("critical"), json!("new")]);
    }

    #[tokio::test]
    async fn test_delete_all_returns_deleted_logs() {
        let storage = setup_storage().await;
        storage
            .save_log(&make_log("a"), "group", PersistenceFlags::DEFAULT)
            .await
            .unwrap();
        storage
            .save_log(&make_log("b"), "other", PersistenceFlags::DEFAULT)
            .await
            .unwrap();
        storage.load_batch("group", 10, &HashSet::new()).await.unwrap();

        let deleted = storage.delete_all("group").await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(storage.count_logs("group").await.unwrap(), 0);
        assert_eq!(storage.count_logs("other").await.unwrap(), 1);
    }

    #[test]
    fn test_extract_pid_from_lock_error() {
        let error_msg = "IO Error: Could not set lock on file \"/path/to/db.duckdb\": Conflicting lock is held in /path/to/binary (deleted) (PID 12345). See also https://duckdb.org/docs/stable/connect/concurrency";
        assert_eq!(extract_pid_from_lock_error(error_msg), Some(12345));
        assert_eq!(extract_pid_from_lock_error("Some other error"), None);
        assert_eq!(extract_pid_from_lock_error("Error (PID abc)"), None);
    }

    #[test]
    #[cfg(unix)]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(999999));
    }
}
