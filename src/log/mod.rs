pub mod container;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

pub use container::LogContainer;

/// A single telemetry record handed to a channel unit.
///
/// The channel pipeline treats the payload as opaque; it only looks at the
/// type tag, the timestamp and the optional target token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// Internal correlation id, assigned when the log is enqueued
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub log_type: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Destination token; the part before the first '-' is the target key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Log {
    pub fn new(log_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            log_type: log_type.into(),
            timestamp: Utc::now(),
            payload,
            target_token: None,
            session_id: None,
        }
    }

    pub fn with_target_token(mut self, token: impl Into<String>) -> Self {
        self.target_token = Some(token.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A log needs at least a type tag to be accepted by a channel
    pub fn is_valid(&self) -> bool {
        !self.log_type.trim().is_empty()
    }

    pub fn target_key(&self) -> Option<&str> {
        self.target_token.as_deref().map(target_key_from_token)
    }
}

/// Extract the target key from a destination token (`<key>-<secret>`).
pub fn target_key_from_token(token: &str) -> &str {
    token.split('-').next().unwrap_or(token)
}

/// Persistence flags passed through enqueue to the storage adapter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistenceFlags(u8);

impl PersistenceFlags {
    pub const NORMAL_PERSISTENCE: Self = Self(0b01);
    pub const CRITICAL: Self = Self(0b10);
    pub const DEFAULT: Self = Self::NORMAL_PERSISTENCE;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b11)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_critical(self) -> bool {
        self.contains(Self::CRITICAL)
    }

    /// Eviction class: critical logs outlive normal ones under capacity pressure.
    pub fn priority(self) -> LogPriority {
        if self.is_critical() {
            LogPriority::Critical
        } else {
            LogPriority::Normal
        }
    }
}

impl Default for PersistenceFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for PersistenceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PersistenceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::NORMAL_PERSISTENCE) {
            names.push("NORMAL_PERSISTENCE");
        }
        if self.contains(Self::CRITICAL) {
            names.push("CRITICAL");
        }
        write!(f, "PersistenceFlags({})", names.join(" | "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogPriority {
    Normal = 1,
    Critical = 2,
}

impl LogPriority {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        if value >= LogPriority::Critical as i32 {
            LogPriority::Critical
        } else {
            LogPriority::Normal
        }
    }
}
