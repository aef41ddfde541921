use super::traits::StorageError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Key under which the install id is stored.
pub const INSTALL_ID_KEY: &str = "install_id";

/// Small key/value store kept apart from the log storage.
///
/// Holds values that must be readable before the log storage is queried,
/// such as the install id and the per-group oldest pending log timestamp.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Unparseable values read as absent.
    fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        let value = self.get(key)?;
        DateTime::parse_from_rfc3339(&value)
            .ok()
            .map(|timestamp| timestamp.with_timezone(&Utc))
    }

    fn set_timestamp(&self, key: &str, value: DateTime<Utc>) -> Result<(), StorageError> {
        self.set(key, value.to_rfc3339())
    }
}

/// Key under which a group's oldest pending log timestamp is stored.
pub fn oldest_pending_log_key(group_id: &str) -> String {
    format!("oldest_pending_log_timestamp.{}", group_id)
}

/// Read the install id, generating and storing one on first use.
pub fn load_or_create_install_id(settings: &dyn SettingsStore) -> Result<Uuid, StorageError> {
    if let Some(value) = settings.get(INSTALL_ID_KEY) {
        match Uuid::parse_str(&value) {
            Ok(install_id) => return Ok(install_id),
            Err(e) => {
                tracing::warn!(error = %e, "Stored install id is invalid, generating a new one");
            }
        }
    }

    let install_id = Uuid::new_v4();
    settings.set(INSTALL_ID_KEY, install_id.to_string())?;
    Ok(install_id)
}

#[derive(Default)]
pub struct InMemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for InMemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// Settings persisted as a JSON object, rewritten on every change.
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileSettings {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let values = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                StorageError::Database(format!(
                    "failed to read settings file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(values)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Database(format!("failed to create settings directory: {}", e))
                })?;
            }
        }
        std::fs::write(&self.path, content).map_err(|e| {
            StorageError::Database(format!(
                "failed to write settings file '{}': {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().map_err(|_| StorageError::LockPoisoned)?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}
