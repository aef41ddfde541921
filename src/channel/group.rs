use super::configuration::{ChannelUnitConfiguration, ConfigurationError};
use super::delegate::{ChannelDelegate, DelegateRegistry};
use super::pause::PauseToken;
use super::unit::{ChannelContext, ChannelUnit, OutcomeDisposition, UnitStats};
use crate::device::DeviceInfo;
use crate::log::{Log, PersistenceFlags};
use crate::sender::{LogSender, SendOutcome};
use crate::storage::{LogStorage, SettingsStore, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel group is no longer running")]
    Closed,

    #[error("invalid channel configuration: {0}")]
    InvalidConfiguration(#[from] ConfigurationError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Messages processed by the channel group worker, in arrival order.
#[derive(Debug)]
pub enum GroupCommand {
    AddChannelUnit {
        config: ChannelUnitConfiguration,
        response_tx: oneshot::Sender<Result<(), ChannelError>>,
    },
    Enqueue {
        group_id: String,
        log: Log,
        flags: PersistenceFlags,
    },
    /// Flush one unit, or every unit when `group_id` is None
    FlushQueue {
        group_id: Option<String>,
    },
    FlushTimerFired {
        group_id: String,
        generation: u64,
    },
    SendCompleted {
        group_id: String,
        batch_id: String,
        outcome: SendOutcome,
    },
    SetEnabled {
        group_id: Option<String>,
        enabled: bool,
        delete_data: bool,
    },
    Suspend,
    Resume,
    SenderSuspensionChanged(bool),
    RecoveryElapsed {
        generation: u64,
    },
    PauseWith {
        group_id: Option<String>,
        token: PauseToken,
    },
    ResumeWith {
        group_id: Option<String>,
        token: PauseToken,
    },
    PauseSendingLogs {
        group_id: String,
        target_token: String,
    },
    ResumeSendingLogs {
        group_id: String,
        target_token: String,
    },
    SetMaxRecords {
        max_records: usize,
        response_tx: oneshot::Sender<Result<usize, ChannelError>>,
    },
    UnitStats {
        group_id: String,
        response_tx: oneshot::Sender<Option<UnitStats>>,
    },
    /// Answered once every earlier command has been processed
    Sync(oneshot::Sender<()>),
    Shutdown,
}

/// Options for a channel group beyond its collaborators.
#[derive(Debug, Clone, Default)]
pub struct ChannelGroupOptions {
    pub device: DeviceInfo,
    /// Automatically resume this long after a recoverable send failure
    pub recovery_interval: Option<Duration>,
}

/// Worker that owns every channel unit of a group.
///
/// All state transitions happen on this single task. Handles talk to it
/// through an unbounded command queue, and spawned sends and timers report
/// back through the same queue.
pub struct ChannelGroupService {
    ctx: ChannelContext,
    units: HashMap<String, ChannelUnit>,
    rx: mpsc::UnboundedReceiver<GroupCommand>,
    enabled: bool,
    /// Suspended after a recoverable failure or an explicit `suspend`
    suspended: bool,
    sender_suspended: bool,
    recovery_interval: Option<Duration>,
    recovery_timer: Option<JoinHandle<()>>,
    recovery_generation: u64,
}

/// Cloneable entry point to a running channel group.
#[derive(Clone)]
pub struct ChannelGroupHandle {
    tx: mpsc::UnboundedSender<GroupCommand>,
    delegates: Arc<DelegateRegistry>,
}

/// Entry point to one unit of a channel group.
#[derive(Clone)]
pub struct ChannelUnitHandle {
    group_id: String,
    tx: mpsc::UnboundedSender<GroupCommand>,
    delegates: Arc<DelegateRegistry>,
}

impl ChannelGroupService {
    pub fn new(
        storage: Arc<dyn LogStorage>,
        sender: Arc<dyn LogSender>,
        settings: Arc<dyn SettingsStore>,
        options: ChannelGroupOptions,
    ) -> (Self, ChannelGroupHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delegates = Arc::new(DelegateRegistry::new());
        let sender_suspended = sender.is_suspended();

        let service = Self {
            ctx: ChannelContext {
                storage,
                sender,
                settings,
                delegates: Arc::clone(&delegates),
                device: options.device,
                commands: tx.downgrade(),
            },
            units: HashMap::new(),
            rx,
            enabled: true,
            suspended: false,
            sender_suspended,
            recovery_interval: options.recovery_interval,
            recovery_timer: None,
            recovery_generation: 0,
        };

        (service, ChannelGroupHandle { tx, delegates })
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Channel group started");
        let watcher = self.spawn_suspension_watcher();

        while let Some(command) = self.rx.recv().await {
            if matches!(command, GroupCommand::Shutdown) {
                debug!("Channel group received shutdown");
                break;
            }
            self.handle_command(command).await;
        }

        watcher.abort();
        if let Some(timer) = self.recovery_timer.take() {
            timer.abort();
        }
        for unit in self.units.values_mut() {
            unit.shutdown();
        }
        info!(units = self.units.len(), "Channel group stopped");
    }

    fn spawn_suspension_watcher(&self) -> JoinHandle<()> {
        let mut suspension = self.ctx.sender.subscribe_suspension();
        let commands = self.ctx.commands.clone();

        tokio::spawn(async move {
            while suspension.changed().await.is_ok() {
                let suspended = *suspension.borrow_and_update();
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands
                    .send(GroupCommand::SenderSuspensionChanged(suspended))
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    fn effective_suspended(&self) -> bool {
        self.suspended || self.sender_suspended
    }

    async fn handle_command(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::AddChannelUnit {
                config,
                response_tx,
            } => {
                let result = self.add_channel_unit(config).await;
                let _ = response_tx.send(result);
            }
            GroupCommand::Enqueue {
                group_id,
                log,
                flags,
            } => match self.units.get_mut(&group_id) {
                Some(unit) => unit.enqueue(&self.ctx, log, flags).await,
                None => warn!(group = %group_id, "Log enqueued for unknown channel, dropping"),
            },
            GroupCommand::FlushQueue { group_id } => {
                for unit in select_units(&mut self.units, group_id.as_deref()) {
                    unit.flush_queue(&self.ctx).await;
                }
            }
            GroupCommand::FlushTimerFired {
                group_id,
                generation,
            } => {
                if let Some(unit) = self.units.get_mut(&group_id) {
                    unit.on_timer_fired(&self.ctx, generation).await;
                }
            }
            GroupCommand::SendCompleted {
                group_id,
                batch_id,
                outcome,
            } => {
                let Some(unit) = self.units.get_mut(&group_id) else {
                    warn!(group = %group_id, batch_id = %batch_id, "Outcome for unknown channel, ignoring");
                    return;
                };
                if unit.handle_send_completed(&self.ctx, &batch_id, outcome).await
                    == OutcomeDisposition::Recoverable
                {
                    self.suspend_after_failure().await;
                }
            }
            GroupCommand::SetEnabled {
                group_id,
                enabled,
                delete_data,
            } => {
                if group_id.is_none() {
                    self.enabled = enabled;
                    self.ctx.sender.set_enabled(enabled);
                    if enabled {
                        self.suspended = false;
                        self.cancel_recovery();
                    }
                }
                for unit in select_units(&mut self.units, group_id.as_deref()) {
                    unit.set_enabled(&self.ctx, enabled, delete_data).await;
                }
                if group_id.is_none() && enabled {
                    self.apply_suspension().await;
                }
            }
            GroupCommand::Suspend => {
                self.suspended = true;
                self.apply_suspension().await;
            }
            GroupCommand::Resume => {
                self.suspended = false;
                self.cancel_recovery();
                self.apply_suspension().await;
            }
            GroupCommand::SenderSuspensionChanged(suspended) => {
                if self.sender_suspended != suspended {
                    info!(suspended, "Sender suspension changed");
                    self.sender_suspended = suspended;
                    self.apply_suspension().await;
                }
            }
            GroupCommand::RecoveryElapsed { generation } => {
                if generation == self.recovery_generation && self.recovery_timer.is_some() {
                    self.recovery_timer = None;
                    info!("Recovery interval elapsed, resuming channels");
                    self.suspended = false;
                    self.apply_suspension().await;
                }
            }
            GroupCommand::PauseWith { group_id, token } => {
                for unit in select_units(&mut self.units, group_id.as_deref()) {
                    unit.pause_with(&self.ctx, token);
                }
            }
            GroupCommand::ResumeWith { group_id, token } => {
                for unit in select_units(&mut self.units, group_id.as_deref()) {
                    unit.resume_with(&self.ctx, token).await;
                }
            }
            GroupCommand::PauseSendingLogs {
                group_id,
                target_token,
            } => {
                if let Some(unit) = self.units.get_mut(&group_id) {
                    unit.pause_sending_logs(&target_token);
                }
            }
            GroupCommand::ResumeSendingLogs {
                group_id,
                target_token,
            } => {
                if let Some(unit) = self.units.get_mut(&group_id) {
                    unit.resume_sending_logs(&self.ctx, &target_token).await;
                }
            }
            GroupCommand::SetMaxRecords {
                max_records,
                response_tx,
            } => {
                let result = self
                    .ctx
                    .storage
                    .set_capacity(max_records)
                    .await
                    .map_err(ChannelError::from);
                match &result {
                    Ok(evicted) => info!(max_records, evicted, "Storage capacity updated"),
                    Err(e) => error!(max_records, error = %e, "Failed to update storage capacity"),
                }
                let _ = response_tx.send(result);
            }
            GroupCommand::UnitStats {
                group_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.units.get(&group_id).map(ChannelUnit::stats));
            }
            GroupCommand::Sync(response_tx) => {
                let _ = response_tx.send(());
            }
            GroupCommand::Shutdown => {}
        }
    }

    async fn add_channel_unit(&mut self, config: ChannelUnitConfiguration) -> Result<(), ChannelError> {
        config.validate()?;

        if self.units.contains_key(&config.group_id) {
            warn!(group = %config.group_id, "Channel already added, keeping existing unit");
            return Ok(());
        }

        let stored = match self.ctx.storage.count_logs(&config.group_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(group = %config.group_id, error = %e, "Failed to count stored logs");
                0
            }
        };

        let mut unit = ChannelUnit::new(config.clone(), self.enabled, self.effective_suspended());
        unit.set_items_count(stored);

        info!(
            group = %config.group_id,
            priority = ?config.priority,
            batch_size = config.batch_size_limit,
            pending_batches = config.pending_batches_limit,
            flush_interval = ?config.flush_interval,
            stored,
            "Channel added"
        );
        self.ctx
            .delegates
            .for_each(|d| d.did_add_channel_unit(&config));

        unit.check_pending_logs(&self.ctx).await;
        self.units.insert(config.group_id, unit);
        Ok(())
    }

    async fn apply_suspension(&mut self) {
        let suspended = self.effective_suspended();
        for unit in self.units.values_mut() {
            if suspended {
                unit.suspend();
            } else {
                unit.resume(&self.ctx).await;
            }
        }
    }

    async fn suspend_after_failure(&mut self) {
        self.suspended = true;
        self.apply_suspension().await;

        let Some(interval) = self.recovery_interval else {
            return;
        };
        let commands = self.ctx.commands.clone();
        self.cancel_recovery();
        self.recovery_generation += 1;
        let generation = self.recovery_generation;

        debug!(?interval, "Scheduling automatic resume");
        self.recovery_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(GroupCommand::RecoveryElapsed { generation });
            }
        }));
    }

    fn cancel_recovery(&mut self) {
        if let Some(timer) = self.recovery_timer.take() {
            timer.abort();
        }
    }
}

/// Units addressed by a command: one group, or all of them.
fn select_units<'a>(
    units: &'a mut HashMap<String, ChannelUnit>,
    group_id: Option<&'a str>,
) -> impl Iterator<Item = &'a mut ChannelUnit> + 'a {
    units
        .values_mut()
        .filter(move |unit| group_id.map_or(true, |g| unit.group_id() == g))
}

impl ChannelGroupHandle {
    fn send(&self, command: GroupCommand) -> Result<(), ChannelError> {
        self.tx.send(command).map_err(|_| ChannelError::Closed)
    }

    /// Register a unit and return its handle. Adding an existing group id
    /// keeps the existing unit.
    pub async fn add_channel_unit(
        &self,
        config: ChannelUnitConfiguration,
    ) -> Result<ChannelUnitHandle, ChannelError> {
        let group_id = config.group_id.clone();
        let (response_tx, response_rx) = oneshot::channel();
        self.send(GroupCommand::AddChannelUnit {
            config,
            response_tx,
        })?;
        response_rx.await.map_err(|_| ChannelError::Closed)??;
        Ok(self.channel_unit(group_id))
    }

    /// Handle to a unit by group id. Commands for an unknown group are dropped.
    pub fn channel_unit(&self, group_id: impl Into<String>) -> ChannelUnitHandle {
        ChannelUnitHandle {
            group_id: group_id.into(),
            tx: self.tx.clone(),
            delegates: Arc::clone(&self.delegates),
        }
    }

    /// Enable or disable every unit and the sender. Disabling with
    /// `delete_data` drops every stored log and discards new ones until
    /// re-enabled.
    pub fn set_enabled(&self, enabled: bool, delete_data: bool) -> Result<(), ChannelError> {
        self.send(GroupCommand::SetEnabled {
            group_id: None,
            enabled,
            delete_data,
        })
    }

    pub fn suspend(&self) -> Result<(), ChannelError> {
        self.send(GroupCommand::Suspend)
    }

    pub fn resume(&self) -> Result<(), ChannelError> {
        self.send(GroupCommand::Resume)
    }

    /// Pause every unit with a fresh token.
    pub fn pause(&self) -> Result<PauseToken, ChannelError> {
        let token = PauseToken::new();
        self.pause_with(token)?;
        Ok(token)
    }

    pub fn pause_with(&self, token: PauseToken) -> Result<(), ChannelError> {
        self.send(GroupCommand::PauseWith {
            group_id: None,
            token,
        })
    }

    pub fn resume_with(&self, token: PauseToken) -> Result<(), ChannelError> {
        self.send(GroupCommand::ResumeWith {
            group_id: None,
            token,
        })
    }

    pub fn flush_all(&self) -> Result<(), ChannelError> {
        self.send(GroupCommand::FlushQueue { group_id: None })
    }

    /// Cap the number of stored records. Returns how many were evicted.
    pub async fn set_max_records(&self, max_records: usize) -> Result<usize, ChannelError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(GroupCommand::SetMaxRecords {
            max_records,
            response_tx,
        })?;
        response_rx.await.map_err(|_| ChannelError::Closed)?
    }

    pub fn add_delegate<D: ChannelDelegate + 'static>(&self, delegate: &Arc<D>) -> bool {
        self.delegates.add(delegate)
    }

    pub fn remove_delegate<D: ChannelDelegate + 'static>(&self, delegate: &Arc<D>) -> bool {
        self.delegates.remove(delegate)
    }

    pub async fn unit_stats(&self, group_id: &str) -> Result<Option<UnitStats>, ChannelError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(GroupCommand::UnitStats {
            group_id: group_id.to_string(),
            response_tx,
        })?;
        response_rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Wait until every previously sent command has been processed.
    pub async fn sync(&self) -> Result<(), ChannelError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(GroupCommand::Sync(response_tx))?;
        response_rx.await.map_err(|_| ChannelError::Closed)
    }

    pub fn shutdown(&self) -> Result<(), ChannelError> {
        self.send(GroupCommand::Shutdown)
    }
}

impl ChannelUnitHandle {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn send(&self, command: GroupCommand) -> Result<(), ChannelError> {
        self.tx.send(command).map_err(|_| ChannelError::Closed)
    }

    /// Hand a log to the unit. Never fails visibly: problems are logged and
    /// reported to delegates.
    pub fn enqueue(&self, mut log: Log, flags: PersistenceFlags) {
        if log.id.is_empty() {
            log.id = Uuid::new_v4().to_string();
        }
        self.delegates
            .for_each(|d| d.did_prepare_log(&self.group_id, &log, flags));

        if self
            .send(GroupCommand::Enqueue {
                group_id: self.group_id.clone(),
                log,
                flags,
            })
            .is_err()
        {
            warn!(group = %self.group_id, "Channel group stopped, log dropped");
        }
    }

    pub fn flush_queue(&self) -> Result<(), ChannelError> {
        self.send(GroupCommand::FlushQueue {
            group_id: Some(self.group_id.clone()),
        })
    }

    pub fn set_enabled(&self, enabled: bool, delete_data: bool) -> Result<(), ChannelError> {
        self.send(GroupCommand::SetEnabled {
            group_id: Some(self.group_id.clone()),
            enabled,
            delete_data,
        })
    }

    pub fn pause(&self) -> Result<PauseToken, ChannelError> {
        let token = PauseToken::new();
        self.pause_with(token)?;
        Ok(token)
    }

    pub fn pause_with(&self, token: PauseToken) -> Result<(), ChannelError> {
        self.send(GroupCommand::PauseWith {
            group_id: Some(self.group_id.clone()),
            token,
        })
    }

    pub fn resume_with(&self, token: PauseToken) -> Result<(), ChannelError> {
        self.send(GroupCommand::ResumeWith {
            group_id: Some(self.group_id.clone()),
            token,
        })
    }

    /// Hold back logs addressed to the token's target key. They are still
    /// persisted.
    pub fn pause_sending_logs(&self, target_token: &str) -> Result<(), ChannelError> {
        self.send(GroupCommand::PauseSendingLogs {
            group_id: self.group_id.clone(),
            target_token: target_token.to_string(),
        })
    }

    pub fn resume_sending_logs(&self, target_token: &str) -> Result<(), ChannelError> {
        self.send(GroupCommand::ResumeSendingLogs {
            group_id: self.group_id.clone(),
            target_token: target_token.to_string(),
        })
    }

    pub async fn stats(&self) -> Result<Option<UnitStats>, ChannelError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(GroupCommand::UnitStats {
            group_id: self.group_id.clone(),
            response_tx,
        })?;
        response_rx.await.map_err(|_| ChannelError::Closed)
    }
}
