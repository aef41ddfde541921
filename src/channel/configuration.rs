use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configured flush intervals above this are shortened by the age of the
/// oldest pending log, so a restart does not restart the wait.
pub const FLUSH_INTERVAL_THRESHOLD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Default,
    High,
    Background,
}

impl Priority {
    /// Default (batch size, pending batches, flush interval) for this priority.
    pub fn default_tuning(self) -> (usize, usize, Duration) {
        match self {
            Priority::Default => (50, 3, Duration::from_secs(3)),
            Priority::High => (10, 6, Duration::from_secs(1)),
            Priority::Background => (100, 1, Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("group id cannot be empty")]
    EmptyGroupId,

    #[error("channel '{0}': batch_size_limit must be greater than 0")]
    ZeroBatchSize(String),

    #[error("channel '{0}': pending_batches_limit must be greater than 0")]
    ZeroPendingBatches(String),
}

/// Immutable per-group configuration of a channel unit.
///
/// Group ids must be unique and should never be reused across releases for a
/// different stream; batches are persisted under the group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUnitConfiguration {
    pub group_id: String,

    #[serde(default)]
    pub priority: Priority,

    /// Number of logs that forces a flush
    pub batch_size_limit: usize,

    /// Maximum number of batches awaiting a send outcome
    pub pending_batches_limit: usize,

    /// Delay before a partially filled batch is flushed
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl ChannelUnitConfiguration {
    pub fn new(
        group_id: impl Into<String>,
        priority: Priority,
        batch_size_limit: usize,
        pending_batches_limit: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            priority,
            batch_size_limit,
            pending_batches_limit,
            flush_interval,
        }
    }

    pub fn with_priority(group_id: impl Into<String>, priority: Priority) -> Self {
        let (batch_size_limit, pending_batches_limit, flush_interval) = priority.default_tuning();
        Self::new(
            group_id,
            priority,
            batch_size_limit,
            pending_batches_limit,
            flush_interval,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.group_id.trim().is_empty() {
            return Err(ConfigurationError::EmptyGroupId);
        }
        if self.batch_size_limit == 0 {
            return Err(ConfigurationError::ZeroBatchSize(self.group_id.clone()));
        }
        if self.pending_batches_limit == 0 {
            return Err(ConfigurationError::ZeroPendingBatches(self.group_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_tuning() {
        let config = ChannelUnitConfiguration::with_priority("analytics", Priority::Default);
        assert_eq!(config.batch_size_limit, 50);
        assert_eq!(config.pending_batches_limit, 3);
        assert_eq!(config.flush_interval, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut config = ChannelUnitConfiguration::with_priority("g", Priority::High);
        config.batch_size_limit = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::ZeroBatchSize("g".to_string()))
        );

        let mut config = ChannelUnitConfiguration::with_priority("g", Priority::High);
        config.pending_batches_limit = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::ZeroPendingBatches("g".to_string()))
        );

        let config = ChannelUnitConfiguration::with_priority(" ", Priority::High);
        assert_eq!(config.validate(), Err(ConfigurationError::EmptyGroupId));
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
group_id: crashes
priority: high
batch_size_limit: 1
pending_batches_limit: 2
flush_interval: 500ms
"#;
        let config: ChannelUnitConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.group_id, "crashes");
        assert_eq!(config.priority, Priority::High);
        assert_eq!(config.flush_interval, Duration::from_millis(500));
    }
}
