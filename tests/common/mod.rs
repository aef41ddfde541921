#![allow(dead_code)]

use async_trait::async_trait;
use courier::channel::{
    ChannelDelegate, ChannelGroupHandle, ChannelGroupOptions, ChannelGroupService,
    ChannelUnitConfiguration, PersistFailure, Priority,
};
use courier::log::{Log, LogContainer, PersistenceFlags};
use courier::sender::{LogSender, SendError, SendOutcome, SendRequest, SuspensionSignal};
use courier::storage::{InMemorySettings, InMemoryStorage, LoadedBatch, LogStorage, StorageError};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub group_id: String,
    pub batch_id: String,
    pub container: LogContainer,
}

impl RecordedSend {
    pub fn log_numbers(&self) -> Vec<u64> {
        self.container
            .logs
            .iter()
            .filter_map(|log| log.payload.get("n").and_then(|n| n.as_u64()))
            .collect()
    }
}

/// Sender answering from a script of outcomes (success once the script is
/// exhausted), or holding every request until the test completes it.
pub struct MockSender {
    sends: Mutex<Vec<RecordedSend>>,
    script: Mutex<VecDeque<SendOutcome>>,
    waiting: Mutex<HashMap<String, oneshot::Sender<SendOutcome>>>,
    manual: bool,
    calls: watch::Sender<usize>,
    suspension: SuspensionSignal,
}

impl Default for MockSender {
    fn default() -> Self {
        let (calls, _) = watch::channel(0);
        Self {
            sends: Mutex::default(),
            script: Mutex::default(),
            waiting: Mutex::default(),
            manual: false,
            calls,
            suspension: SuspensionSignal::default(),
        }
    }
}

impl MockSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(outcomes: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            ..Self::default()
        })
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            manual: true,
            ..Self::default()
        })
    }

    pub fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().unwrap().clone()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspension.set(suspended);
    }

    /// Wait until at least `count` sends were issued and return them all.
    pub async fn wait_for_sends(&self, count: usize) -> Vec<RecordedSend> {
        let mut calls = self.calls.subscribe();
        tokio::time::timeout(WAIT, calls.wait_for(|c| *c >= count))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} sends", count))
            .unwrap();
        self.sends()
    }

    /// Resolve a held request in manual mode.
    pub fn complete(&self, batch_id: &str, outcome: SendOutcome) {
        let waiter = self
            .waiting
            .lock()
            .unwrap()
            .remove(batch_id)
            .unwrap_or_else(|| panic!("no request held for batch {}", batch_id));
        waiter.send(outcome).unwrap();
    }
}

#[async_trait]
impl LogSender for MockSender {
    async fn send(&self, request: SendRequest) -> SendOutcome {
        let container: LogContainer = serde_json::from_slice(&request.payload).unwrap();
        let held = if self.manual {
            let (tx, rx) = oneshot::channel();
            self.waiting
                .lock()
                .unwrap()
                .insert(request.batch_id.clone(), tx);
            Some(rx)
        } else {
            None
        };

        self.sends.lock().unwrap().push(RecordedSend {
            group_id: request.group_id,
            batch_id: request.batch_id,
            container,
        });
        self.calls.send_modify(|c| *c += 1);

        match held {
            Some(rx) => rx
                .await
                .unwrap_or(SendOutcome::Recoverable(SendError::Cancelled)),
            None => self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(SendOutcome::Success),
        }
    }

    fn is_suspended(&self) -> bool {
        self.suspension.get()
    }

    fn subscribe_suspension(&self) -> watch::Receiver<bool> {
        self.suspension.subscribe()
    }
}

/// In-memory storage counting calls that matter to delivery guarantees.
#[derive(Default)]
pub struct CountingStorage {
    pub inner: InMemoryStorage,
    pub saves: AtomicUsize,
    pub batch_deletes: AtomicUsize,
}

impl CountingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl LogStorage for CountingStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.inner.init_schema().await
    }

    async fn save_log(
        &self,
        log: &Log,
        group_id: &str,
        flags: PersistenceFlags,
    ) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_log(log, group_id, flags).await
    }

    async fn load_batch(
        &self,
        group_id: &str,
        limit: usize,
        excluded_target_keys: &HashSet<String>,
    ) -> Result<LoadedBatch, StorageError> {
        self.inner
            .load_batch(group_id, limit, excluded_target_keys)
            .await
    }

    async fn delete_batch(&self, group_id: &str, batch_id: &str) -> Result<usize, StorageError> {
        self.batch_deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_batch(group_id, batch_id).await
    }

    async fn release_batch(&self, group_id: &str, batch_id: &str) -> Result<(), StorageError> {
        self.inner.release_batch(group_id, batch_id).await
    }

    async fn delete_all(&self, group_id: &str) -> Result<Vec<Log>, StorageError> {
        self.inner.delete_all(group_id).await
    }

    async fn count_logs(&self, group_id: &str) -> Result<usize, StorageError> {
        self.inner.count_logs(group_id).await
    }

    async fn set_capacity(&self, max_records: usize) -> Result<usize, StorageError> {
        self.inner.set_capacity(max_records).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Prepared(String),
    Enqueued(String),
    Persisted(String),
    PersistFailed(String, PersistFailure),
    WillSend(String),
    Succeeded(String),
    Failed(String, SendError),
    SetEnabled(bool, bool),
}

#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<Event>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl ChannelDelegate for RecordingDelegate {
    fn did_prepare_log(&self, _group_id: &str, log: &Log, _flags: PersistenceFlags) {
        self.push(Event::Prepared(log.id.clone()));
    }

    fn did_enqueue_log(&self, _group_id: &str, log: &Log) {
        self.push(Event::Enqueued(log.id.clone()));
    }

    fn on_finished_persisting_log(&self, _group_id: &str, log: &Log) {
        self.push(Event::Persisted(log.id.clone()));
    }

    fn on_failed_persisting_log(&self, _group_id: &str, log: &Log, reason: &PersistFailure) {
        self.push(Event::PersistFailed(log.id.clone(), reason.clone()));
    }

    fn will_send_log(&self, _group_id: &str, log: &Log) {
        self.push(Event::WillSend(log.id.clone()));
    }

    fn did_succeed_sending_log(&self, _group_id: &str, log: &Log) {
        self.push(Event::Succeeded(log.id.clone()));
    }

    fn did_fail_sending_log(&self, _group_id: &str, log: &Log, error: &SendError) {
        self.push(Event::Failed(log.id.clone(), error.clone()));
    }

    fn did_set_enabled(&self, _group_id: &str, enabled: bool, deleted_data: bool) {
        self.push(Event::SetEnabled(enabled, deleted_data));
    }
}

pub struct Harness {
    pub handle: ChannelGroupHandle,
    pub storage: Arc<CountingStorage>,
    pub sender: Arc<MockSender>,
    pub settings: Arc<InMemorySettings>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn start(sender: Arc<MockSender>) -> Self {
        Self::start_with(CountingStorage::new(), sender, ChannelGroupOptions::default())
    }

    pub fn start_with(
        storage: Arc<CountingStorage>,
        sender: Arc<MockSender>,
        options: ChannelGroupOptions,
    ) -> Self {
        let settings = Arc::new(InMemorySettings::new());
        let (service, handle) =
            ChannelGroupService::new(storage.clone(), sender.clone(), settings.clone(), options);
        let task = tokio::spawn(service.run());

        Self {
            handle,
            storage,
            sender,
            settings,
            task,
        }
    }

    pub async fn stop(self) {
        self.handle.shutdown().unwrap();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("channel group did not stop")
            .unwrap();
    }
}

pub fn channel(
    group_id: &str,
    batch_size_limit: usize,
    pending_batches_limit: usize,
    flush_interval: Duration,
) -> ChannelUnitConfiguration {
    ChannelUnitConfiguration::new(
        group_id,
        Priority::Default,
        batch_size_limit,
        pending_batches_limit,
        flush_interval,
    )
}

pub fn event(n: u64) -> Log {
    Log::new("event", json!({ "n": n }))
}

/// Poll `check` until it holds or the wait times out.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}
