//! Per-group batching, flow control and delivery of logs.
//!
//! A [`ChannelGroupService`] owns one channel unit per log group and drives
//! them all from a single task. Callers interact through cloneable
//! [`ChannelGroupHandle`] and [`ChannelUnitHandle`] values.

pub mod configuration;
pub mod delegate;
pub mod group;
pub mod pause;
mod unit;

pub use configuration::{
    ChannelUnitConfiguration, ConfigurationError, Priority, FLUSH_INTERVAL_THRESHOLD,
};
pub use delegate::{ChannelDelegate, DelegateRegistry, PersistFailure};
pub use group::{
    ChannelError, ChannelGroupHandle, ChannelGroupOptions, ChannelGroupService, ChannelUnitHandle,
    GroupCommand,
};
pub use pause::{PauseToken, PauseTracker};
pub use unit::UnitStats;
