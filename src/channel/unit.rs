use super::configuration::{ChannelUnitConfiguration, FLUSH_INTERVAL_THRESHOLD};
use super::delegate::{DelegateRegistry, PersistFailure};
use super::group::GroupCommand;
use super::pause::{PauseToken, PauseTracker};
use crate::device::DeviceInfo;
use crate::log::{Log, LogContainer, PersistenceFlags};
use crate::sender::{LogSender, SendError, SendOutcome, SendRequest};
use crate::storage::settings::oldest_pending_log_key;
use crate::storage::{LogStorage, SettingsStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every unit of a channel group.
pub(crate) struct ChannelContext {
    pub storage: Arc<dyn LogStorage>,
    pub sender: Arc<dyn LogSender>,
    pub settings: Arc<dyn SettingsStore>,
    pub delegates: Arc<DelegateRegistry>,
    pub device: DeviceInfo,
    /// Weak so that spawned timers and sends never keep the group alive
    pub commands: WeakUnboundedSender<GroupCommand>,
}

/// Point-in-time view of a unit's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStats {
    pub group_id: String,
    /// Logs persisted since the last flush
    pub items_count: usize,
    pub pending_batch_ids: Vec<String>,
    pub available_batch_from_storage: bool,
    pub enabled: bool,
    pub suspended: bool,
    pub discard_logs: bool,
    pub paused: bool,
    pub paused_target_keys: Vec<String>,
    pub timer_armed: bool,
}

/// How a send outcome was absorbed by the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutcomeDisposition {
    Handled,
    /// The group must suspend every unit
    Recoverable,
    /// The batch id was not pending
    Ignored,
}

struct PendingBatch {
    batch_id: String,
    logs: Vec<Log>,
}

#[derive(Default)]
struct FlushTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl FlushTimer {
    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Compute the effective flush delay.
///
/// Intervals above the threshold are counted from the oldest pending log's
/// timestamp kept in the settings store, so the wait survives restarts. A
/// missing or future timestamp is reset to `now`.
pub(crate) fn resolve_flush_interval(
    configured: Duration,
    settings: &dyn SettingsStore,
    key: &str,
    now: DateTime<Utc>,
) -> Duration {
    if configured <= FLUSH_INTERVAL_THRESHOLD {
        return configured;
    }

    let oldest = match settings.get_timestamp(key) {
        Some(timestamp) if timestamp <= now => timestamp,
        _ => {
            if let Err(e) = settings.set_timestamp(key, now) {
                warn!(key, error = %e, "Failed to record oldest pending log timestamp");
            }
            now
        }
    };

    let scheduled = chrono::Duration::from_std(configured)
        .ok()
        .and_then(|interval| oldest.checked_add_signed(interval))
        .unwrap_or(now);

    if scheduled <= now {
        if let Err(e) = settings.remove(key) {
            warn!(key, error = %e, "Failed to clear oldest pending log timestamp");
        }
        Duration::ZERO
    } else {
        (scheduled - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Batching and flow-control state machine for one log group.
///
/// Owned by the group worker; every method runs on that single task, so no
/// locking is needed here.
pub(crate) struct ChannelUnit {
    config: ChannelUnitConfiguration,
    items_count: usize,
    pending_batches: Vec<PendingBatch>,
    available_batch_from_storage: bool,
    enabled: bool,
    group_suspended: bool,
    discard_logs: bool,
    pause: PauseTracker,
    timer: FlushTimer,
}

impl ChannelUnit {
    pub fn new(config: ChannelUnitConfiguration, enabled: bool, suspended: bool) -> Self {
        Self {
            config,
            items_count: 0,
            pending_batches: Vec::new(),
            available_batch_from_storage: false,
            enabled,
            group_suspended: suspended,
            discard_logs: false,
            pause: PauseTracker::new(),
            timer: FlushTimer::default(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    /// Seed the count of not-yet-flushed logs, e.g. from what survived a restart.
    pub fn set_items_count(&mut self, count: usize) {
        self.items_count = count;
    }

    /// A disabled unit is always suspended
    fn is_suspended(&self) -> bool {
        !self.enabled || self.group_suspended
    }

    fn is_paused(&self) -> bool {
        self.is_suspended() || self.pause.is_paused()
    }

    pub fn stats(&self) -> UnitStats {
        let mut paused_target_keys: Vec<String> =
            self.pause.paused_target_keys().iter().cloned().collect();
        paused_target_keys.sort();

        UnitStats {
            group_id: self.config.group_id.clone(),
            items_count: self.items_count,
            pending_batch_ids: self
                .pending_batches
                .iter()
                .map(|b| b.batch_id.clone())
                .collect(),
            available_batch_from_storage: self.available_batch_from_storage,
            enabled: self.enabled,
            suspended: self.is_suspended(),
            discard_logs: self.discard_logs,
            paused: self.pause.is_paused(),
            paused_target_keys,
            timer_armed: self.timer.is_armed(),
        }
    }

    pub async fn enqueue(&mut self, ctx: &ChannelContext, log: Log, flags: PersistenceFlags) {
        let group_id = self.config.group_id.as_str();

        if !log.is_valid() {
            warn!(group = group_id, "Dropping log without a type");
            return;
        }

        if self.discard_logs {
            warn!(
                group = group_id,
                log_type = %log.log_type,
                "Channel disabled, discarding log"
            );
            ctx.delegates
                .for_each(|d| d.on_failed_persisting_log(group_id, &log, &PersistFailure::Discarded));
            return;
        }

        let filtered = ctx.delegates.should_filter(group_id, &log);
        ctx.delegates.for_each(|d| d.did_enqueue_log(group_id, &log));

        if filtered {
            debug!(group = group_id, log_id = %log.id, "Log filtered out by delegate");
            ctx.delegates
                .for_each(|d| d.on_failed_persisting_log(group_id, &log, &PersistFailure::Filtered));
            return;
        }

        match ctx.storage.save_log(&log, group_id, flags).await {
            Ok(()) => {
                self.items_count += 1;
                debug!(
                    group = group_id,
                    log_id = %log.id,
                    items = self.items_count,
                    "Log persisted"
                );
                ctx.delegates
                    .for_each(|d| d.on_finished_persisting_log(group_id, &log));
                self.check_pending_logs(ctx).await;
            }
            Err(e) => {
                warn!(group = group_id, log_id = %log.id, error = %e, "Failed to persist log");
                let reason = PersistFailure::Storage(e.to_string());
                ctx.delegates
                    .for_each(|d| d.on_failed_persisting_log(group_id, &log, &reason));
            }
        }
    }

    /// Flush now if a full batch is waiting, otherwise make sure a flush is scheduled.
    pub async fn check_pending_logs(&mut self, ctx: &ChannelContext) {
        if !self.is_paused() && self.items_count >= self.config.batch_size_limit {
            self.flush_queue(ctx).await;
        } else if self.items_count > 0 {
            let interval = resolve_flush_interval(
                self.config.flush_interval,
                ctx.settings.as_ref(),
                &oldest_pending_log_key(&self.config.group_id),
                Utc::now(),
            );
            if interval.is_zero() {
                self.flush_queue(ctx).await;
            } else if !self.timer.is_armed() {
                self.start_timer(ctx, interval);
            }
        }
    }

    /// Claim and send batches until storage runs dry or the pending cap is hit.
    pub async fn flush_queue(&mut self, ctx: &ChannelContext) {
        self.timer.cancel();

        loop {
            if self.discard_logs {
                return;
            }

            if self.is_paused() || self.pending_batches.len() >= self.config.pending_batches_limit {
                // Remember that logs are waiting so the next outcome or resume drains them
                let stored = match ctx.storage.count_logs(&self.config.group_id).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(group = %self.config.group_id, error = %e, "Failed to count stored logs");
                        self.items_count
                    }
                };
                if stored > 0 {
                    self.available_batch_from_storage = true;
                }
                debug!(
                    group = %self.config.group_id,
                    paused = self.is_paused(),
                    pending = self.pending_batches.len(),
                    "Flush deferred"
                );
                return;
            }

            self.items_count = 0;
            if let Err(e) = ctx
                .settings
                .remove(&oldest_pending_log_key(&self.config.group_id))
            {
                warn!(group = %self.config.group_id, error = %e, "Failed to clear oldest pending log timestamp");
            }

            let loaded = match ctx
                .storage
                .load_batch(
                    &self.config.group_id,
                    self.config.batch_size_limit,
                    self.pause.paused_target_keys(),
                )
                .await
            {
                Ok(loaded) => loaded,
                Err(e) => {
                    error!(group = %self.config.group_id, error = %e, "Failed to load batch from storage");
                    return;
                }
            };

            self.available_batch_from_storage = loaded.has_more;

            let Some(batch_id) = loaded.batch_id else {
                return;
            };
            self.send_batch(ctx, batch_id, loaded.logs);

            if !self.available_batch_from_storage {
                return;
            }
        }
    }

    fn send_batch(&mut self, ctx: &ChannelContext, batch_id: String, logs: Vec<Log>) {
        let group_id = self.config.group_id.clone();

        for log in &logs {
            ctx.delegates.for_each(|d| d.will_send_log(&group_id, log));
        }
        info!(
            group = %group_id,
            batch_id = %batch_id,
            logs = logs.len(),
            pending = self.pending_batches.len() + 1,
            "Sending batch"
        );

        let container = LogContainer::new(
            batch_id.clone(),
            group_id.clone(),
            ctx.device.clone(),
            logs.clone(),
        );
        self.pending_batches.push(PendingBatch {
            batch_id: batch_id.clone(),
            logs,
        });

        let commands = ctx.commands.clone();

        let payload = match container.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                let outcome = SendOutcome::Fatal(SendError::InvalidRequest(e.to_string()));
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(GroupCommand::SendCompleted {
                        group_id,
                        batch_id,
                        outcome,
                    });
                }
                return;
            }
        };

        let sender = Arc::clone(&ctx.sender);
        tokio::spawn(async move {
            let outcome = sender
                .send(SendRequest {
                    group_id: group_id.clone(),
                    batch_id: batch_id.clone(),
                    payload,
                })
                .await;
            match commands.upgrade() {
                Some(commands) => {
                    let _ = commands.send(GroupCommand::SendCompleted {
                        group_id,
                        batch_id,
                        outcome,
                    });
                }
                None => {
                    debug!(group = %group_id, batch_id = %batch_id, "Channel group stopped, outcome dropped");
                }
            }
        });
    }

    /// Reconcile storage and pending state with a send outcome.
    ///
    /// Outcomes for batch ids that are not pending are ignored, so a batch is
    /// deleted at most once.
    pub async fn handle_send_completed(
        &mut self,
        ctx: &ChannelContext,
        batch_id: &str,
        outcome: SendOutcome,
    ) -> OutcomeDisposition {
        let group_id = self.config.group_id.clone();

        let Some(position) = self
            .pending_batches
            .iter()
            .position(|b| b.batch_id == batch_id)
        else {
            warn!(group = %group_id, batch_id, "Outcome for unknown batch, ignoring");
            return OutcomeDisposition::Ignored;
        };
        let batch = self.pending_batches.remove(position);

        match outcome {
            SendOutcome::Success => {
                if let Err(e) = ctx.storage.delete_batch(&group_id, batch_id).await {
                    error!(group = %group_id, batch_id, error = %e, "Failed to delete sent batch");
                }
                for log in &batch.logs {
                    ctx.delegates
                        .for_each(|d| d.did_succeed_sending_log(&group_id, log));
                }
                info!(group = %group_id, batch_id, logs = batch.logs.len(), "Batch sent");
            }
            SendOutcome::Recoverable(e) => {
                warn!(group = %group_id, batch_id, error = %e, "Recoverable send failure, suspending");
                if let Err(e) = ctx.storage.release_batch(&group_id, batch_id).await {
                    error!(group = %group_id, batch_id, error = %e, "Failed to release batch");
                }
                self.available_batch_from_storage = true;
                return OutcomeDisposition::Recoverable;
            }
            SendOutcome::Fatal(e) => {
                error!(group = %group_id, batch_id, error = %e, "Fatal send failure, dropping batch");
                if let Err(e) = ctx.storage.delete_batch(&group_id, batch_id).await {
                    error!(group = %group_id, batch_id, error = %e, "Failed to delete failed batch");
                }
                for log in &batch.logs {
                    ctx.delegates
                        .for_each(|d| d.did_fail_sending_log(&group_id, log, &e));
                }
            }
        }

        if self.available_batch_from_storage {
            self.flush_queue(ctx).await;
        }
        OutcomeDisposition::Handled
    }

    /// Pick up where sending stopped: drain a known backlog, otherwise
    /// re-evaluate the flush conditions.
    async fn drain(&mut self, ctx: &ChannelContext) {
        if self.is_paused() {
            return;
        }
        if self.available_batch_from_storage {
            self.flush_queue(ctx).await;
        } else {
            self.check_pending_logs(ctx).await;
        }
    }

    pub async fn set_enabled(&mut self, ctx: &ChannelContext, enabled: bool, delete_data: bool) {
        let group_id = self.config.group_id.clone();

        if self.enabled != enabled {
            self.enabled = enabled;
            if enabled {
                info!(group = %group_id, "Channel enabled");
            } else {
                self.timer.cancel();
                info!(group = %group_id, delete_data, "Channel disabled");
            }
        }

        if !enabled && delete_data {
            match ctx.storage.delete_all(&group_id).await {
                Ok(deleted) => {
                    for log in &deleted {
                        ctx.delegates.for_each(|d| {
                            d.did_fail_sending_log(&group_id, log, &SendError::Cancelled)
                        });
                    }
                    info!(group = %group_id, deleted = deleted.len(), "Deleted stored logs");
                }
                Err(e) => {
                    error!(group = %group_id, error = %e, "Failed to delete stored logs");
                }
            }
            if let Err(e) = ctx.settings.remove(&oldest_pending_log_key(&group_id)) {
                warn!(group = %group_id, error = %e, "Failed to clear oldest pending log timestamp");
            }
            self.pending_batches.clear();
            self.items_count = 0;
            self.available_batch_from_storage = false;
            self.discard_logs = true;
        } else {
            self.discard_logs = false;
        }

        ctx.delegates
            .for_each(|d| d.did_set_enabled(&group_id, enabled, delete_data));

        if enabled {
            self.drain(ctx).await;
        }
    }

    /// Group-level suspension
    pub fn suspend(&mut self) {
        if !self.group_suspended {
            self.group_suspended = true;
            self.timer.cancel();
            debug!(group = %self.config.group_id, "Channel suspended");
        }
    }

    pub async fn resume(&mut self, ctx: &ChannelContext) {
        if self.group_suspended {
            self.group_suspended = false;
            debug!(group = %self.config.group_id, "Channel resumed");
            self.drain(ctx).await;
        }
    }

    pub fn pause_with(&mut self, ctx: &ChannelContext, token: PauseToken) {
        if self.pause.pause(token) {
            self.timer.cancel();
            info!(group = %self.config.group_id, %token, "Channel paused");
            ctx.delegates
                .for_each(|d| d.did_pause(&self.config.group_id, &token));
        }
    }

    pub async fn resume_with(&mut self, ctx: &ChannelContext, token: PauseToken) {
        if !self.pause.resume(token) {
            debug!(group = %self.config.group_id, %token, "Resume with unknown token ignored");
            return;
        }

        info!(
            group = %self.config.group_id,
            %token,
            still_paused = self.pause.is_paused(),
            "Pause token released"
        );
        ctx.delegates
            .for_each(|d| d.did_resume(&self.config.group_id, &token));
        self.drain(ctx).await;
    }

    pub fn pause_sending_logs(&mut self, target_token: &str) {
        if self.pause.pause_target_token(target_token) {
            info!(group = %self.config.group_id, "Paused sending logs for target");
        }
    }

    /// Logs held back for the target become eligible for the next batch.
    pub async fn resume_sending_logs(&mut self, ctx: &ChannelContext, target_token: &str) {
        if self.pause.resume_target_token(target_token) {
            info!(group = %self.config.group_id, "Resumed sending logs for target");
            self.available_batch_from_storage = true;
            self.drain(ctx).await;
        }
    }

    fn start_timer(&mut self, ctx: &ChannelContext, interval: Duration) {
        self.timer.cancel();
        self.timer.generation += 1;

        let generation = self.timer.generation;
        let group_id = self.config.group_id.clone();
        let commands = ctx.commands.clone();

        debug!(group = %group_id, ?interval, "Flush timer armed");
        self.timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(GroupCommand::FlushTimerFired {
                    group_id,
                    generation,
                });
            }
        }));
    }

    pub async fn on_timer_fired(&mut self, ctx: &ChannelContext, generation: u64) {
        if generation != self.timer.generation || !self.timer.is_armed() {
            return;
        }
        self.timer.handle = None;
        debug!(group = %self.config.group_id, "Flush timer fired");
        self.flush_queue(ctx).await;
    }

    pub fn shutdown(&mut self) {
        self.timer.cancel();
    }
}
