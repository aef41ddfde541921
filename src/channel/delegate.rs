use super::configuration::ChannelUnitConfiguration;
use super::pause::PauseToken;
use crate::log::{Log, PersistenceFlags};
use crate::sender::SendError;
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;

/// Why a log never made it into storage
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistFailure {
    #[error("channel is disabled and discarding logs")]
    Discarded,

    #[error("log was filtered out by a delegate")]
    Filtered,

    #[error("storage rejected the log: {0}")]
    Storage(String),
}

/// Observer of channel lifecycle events.
///
/// Every method has a no-op default; implement only what you need. Calls are
/// made from the channel group's worker task (except `did_prepare_log`, which
/// runs on the enqueuing caller) and must not block.
#[allow(unused_variables)]
pub trait ChannelDelegate: Send + Sync {
    fn did_add_channel_unit(&self, config: &ChannelUnitConfiguration) {}

    fn did_prepare_log(&self, group_id: &str, log: &Log, flags: PersistenceFlags) {}

    fn did_enqueue_log(&self, group_id: &str, log: &Log) {}

    /// Returning true from any delegate drops the log before persistence.
    fn should_filter_log(&self, group_id: &str, log: &Log) -> bool {
        false
    }

    fn on_finished_persisting_log(&self, group_id: &str, log: &Log) {}

    fn on_failed_persisting_log(&self, group_id: &str, log: &Log, reason: &PersistFailure) {}

    fn will_send_log(&self, group_id: &str, log: &Log) {}

    fn did_succeed_sending_log(&self, group_id: &str, log: &Log) {}

    fn did_fail_sending_log(&self, group_id: &str, log: &Log, error: &SendError) {}

    fn did_set_enabled(&self, group_id: &str, enabled: bool, deleted_data: bool) {}

    fn did_pause(&self, group_id: &str, token: &PauseToken) {}

    fn did_resume(&self, group_id: &str, token: &PauseToken) {}
}

/// Set of weakly held delegates.
///
/// The registry never keeps an observer alive; entries whose observer was
/// dropped are pruned on the next broadcast.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: RwLock<Vec<Weak<dyn ChannelDelegate>>>,
}

fn address(delegate: &Weak<dyn ChannelDelegate>) -> *const () {
    delegate.as_ptr() as *const ()
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delegate. Adding the same delegate twice is a no-op.
    pub fn add<D: ChannelDelegate + 'static>(&self, delegate: &Arc<D>) -> bool {
        let weak: Weak<dyn ChannelDelegate> = Arc::downgrade(delegate) as Weak<dyn ChannelDelegate>;
        let Ok(mut delegates) = self.delegates.write() else {
            tracing::error!("Delegate registry lock poisoned, delegate not added");
            return false;
        };

        delegates.retain(|d| d.strong_count() > 0);
        if delegates.iter().any(|d| address(d) == address(&weak)) {
            return false;
        }
        delegates.push(weak);
        true
    }

    pub fn remove<D: ChannelDelegate + 'static>(&self, delegate: &Arc<D>) -> bool {
        let weak: Weak<dyn ChannelDelegate> = Arc::downgrade(delegate) as Weak<dyn ChannelDelegate>;
        let Ok(mut delegates) = self.delegates.write() else {
            return false;
        };

        let before = delegates.len();
        delegates.retain(|d| d.strong_count() > 0 && address(d) != address(&weak));
        delegates.len() != before
    }

    /// Number of registered delegates that are still alive
    pub fn len(&self) -> usize {
        self.delegates
            .read()
            .map(|d| d.iter().filter(|d| d.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self) -> Vec<Arc<dyn ChannelDelegate>> {
        let live: Vec<Arc<dyn ChannelDelegate>> = match self.delegates.read() {
            Ok(delegates) => delegates.iter().filter_map(Weak::upgrade).collect(),
            Err(_) => return Vec::new(),
        };

        if let Ok(mut delegates) = self.delegates.try_write() {
            delegates.retain(|d| d.strong_count() > 0);
        }
        live
    }

    /// Broadcast to every live delegate
    pub fn for_each(&self, mut f: impl FnMut(&dyn ChannelDelegate)) {
        for delegate in self.live() {
            f(delegate.as_ref());
        }
    }

    /// Logical OR of every delegate's answer
    pub fn should_filter(&self, group_id: &str, log: &Log) -> bool {
        self.live()
            .iter()
            .any(|delegate| delegate.should_filter_log(group_id, log))
    }
}
