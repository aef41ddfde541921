use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("ingestion returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("sender is suspended")]
    Suspended,

    #[error("sender is disabled")]
    Disabled,

    #[error("batch was cancelled before it could be sent")]
    Cancelled,

    #[error("failed to build request: {0}")]
    InvalidRequest(String),
}

/// Classification of a transmission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// The same data should be retried later
    Recoverable(SendError),
    /// The data must be discarded
    Fatal(SendError),
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub group_id: String,
    pub batch_id: String,
    pub payload: Vec<u8>,
}

/// Network transmission of one opaque batch payload.
#[async_trait]
pub trait LogSender: Send + Sync {
    async fn send(&self, request: SendRequest) -> SendOutcome;

    /// True while the transport is globally unusable (offline, backing off)
    fn is_suspended(&self) -> bool;

    fn subscribe_suspension(&self) -> watch::Receiver<bool>;

    fn set_enabled(&self, _enabled: bool) {}
}

/// Shared suspended/not-suspended flag with change notification.
#[derive(Debug)]
pub struct SuspensionSignal {
    tx: watch::Sender<bool>,
}

impl SuspensionSignal {
    pub fn new(suspended: bool) -> Self {
        let (tx, _) = watch::channel(suspended);
        Self { tx }
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag; subscribers are only woken on an actual change.
    pub fn set(&self, suspended: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == suspended {
                false
            } else {
                *current = suspended;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for SuspensionSignal {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_suspension_signal_notifies_on_change_only() {
        let signal = SuspensionSignal::default();
        let mut rx = signal.subscribe();

        assert!(!signal.set(false));
        assert!(!rx.has_changed().unwrap());

        assert!(signal.set(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(signal.get());
    }
}
