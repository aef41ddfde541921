use crate::channel::ChannelUnitConfiguration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub channels: Vec<ChannelUnitConfiguration>,
    /// Resume automatically this long after a recoverable failure suspended the group
    #[serde(default, with = "humantime_serde")]
    pub recovery_interval: Option<Duration>,
}

impl Config {
    pub fn channel(&self, group_id: &str) -> Option<&ChannelUnitConfiguration> {
        self.channels.iter().find(|c| c.group_id == group_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub url: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_retry_intervals", with = "duration_list")]
    pub retry_intervals: Vec<Duration>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            app_secret: String::new(),
            timeout: default_timeout(),
            retry_intervals: default_retry_intervals(),
            enabled: default_enabled(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_intervals() -> Vec<Duration> {
    vec![
        Duration::from_secs(10),
        Duration::from_secs(5 * 60),
        Duration::from_secs(20 * 60),
    ]
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DuckDB file; logs are kept in memory only when absent
    pub path: Option<PathBuf>,
    pub max_records: Option<usize>,
    /// JSON file for per-group flush bookkeeping
    pub settings_path: Option<PathBuf>,
}

// Lists of humantime durations ("10s", "5m")
mod duration_list {
    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wrapped: Vec<Serde<Duration>> = durations.iter().copied().map(Serde::from).collect();
        wrapped.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wrapped = Vec::<Serde<Duration>>::deserialize(deserializer)?;
        Ok(wrapped.into_iter().map(Serde::into_inner).collect())
    }
}
