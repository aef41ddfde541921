use crate::channel::{ChannelError, ChannelGroupHandle, ChannelGroupOptions, ChannelGroupService};
use crate::config::{load_config, Config};
use crate::device::DeviceInfo;
use crate::log::{Log, PersistenceFlags};
use crate::sender::{HttpSender, SendError};
use crate::storage::{
    load_or_create_install_id, DuckDbStorage, InMemorySettings, InMemoryStorage,
    JsonFileSettings, LogStorage, SettingsStore,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

/// Upper bound on waiting for in-flight batches at exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("sender error: {0}")]
    Sender(#[from] SendError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("failed to read input: {0}")]
    Input(#[from] std::io::Error),

    #[error("unknown channel '{0}'")]
    UnknownGroup(String),

    #[error("invalid input record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One line of input
#[derive(Debug, Deserialize)]
pub struct InputRecord {
    #[serde(default)]
    pub group: Option<String>,

    #[serde(rename = "type")]
    pub log_type: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub target_token: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub critical: bool,
}

impl InputRecord {
    pub fn parse(line: &str) -> Result<Self, RunError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn into_log(self) -> (Option<String>, Log, PersistenceFlags) {
        let mut log = Log::new(self.log_type, self.payload);
        log.target_token = self.target_token;
        log.session_id = self.session_id;

        let flags = if self.critical {
            PersistenceFlags::CRITICAL
        } else {
            PersistenceFlags::DEFAULT
        };
        (self.group, log, flags)
    }
}

pub async fn run(
    config_path: Option<PathBuf>,
    input: Option<PathBuf>,
    group: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/courier/config.yml");
            eprintln!("  /etc/courier/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'courier config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_pipeline(&config_path, input.as_deref(), group).await.map_err(|e| e.into())
}

async fn run_pipeline(
    config_path: &Path,
    input: Option<&Path>,
    default_group: Option<String>,
) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let default_group = match default_group {
        Some(group) if config.channel(&group).is_none() => {
            return Err(RunError::UnknownGroup(group));
        }
        Some(group) => group,
        // validation guarantees at least one channel
        None => config
            .channels
            .first()
            .map(|c| c.group_id.clone())
            .unwrap_or_default(),
    };

    let storage = open_storage(&config)?;
    storage.init_schema().await?;
    if let Some(max_records) = config.storage.max_records {
        storage.set_capacity(max_records).await?;
    }
    let settings = open_settings(&config)?;

    let install_id = load_or_create_install_id(settings.as_ref())?;
    let sender = Arc::new(HttpSender::new(&config.ingestion, install_id)?);
    info!(endpoint = %sender.endpoint(), %install_id, "HTTP sender ready");

    let (service, handle) = ChannelGroupService::new(
        storage,
        sender,
        settings,
        ChannelGroupOptions {
            device: DeviceInfo::collect(),
            recovery_interval: config.recovery_interval,
        },
    );
    let service_handle = tokio::spawn(service.run());

    let mut units = HashMap::new();
    for channel in &config.channels {
        let unit = handle.add_channel_unit(channel.clone()).await?;
        units.insert(channel.group_id.clone(), unit);
    }
    if !config.ingestion.enabled {
        warn!("Ingestion disabled, logs will be stored but not sent");
    }

    info!(default_group = %default_group, "Reading logs, press Ctrl+C to stop");
    let enqueued = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            read_until_interrupted(BufReader::new(file), &units, &default_group).await?
        }
        None => {
            read_until_interrupted(BufReader::new(tokio::io::stdin()), &units, &default_group)
                .await?
        }
    };
    info!(enqueued, "Input finished, flushing");

    handle.flush_all()?;
    drain(&handle, &config).await?;

    handle.shutdown()?;
    service_handle.await?;
    info!("Shutdown complete");

    Ok(())
}

fn open_storage(config: &Config) -> Result<Arc<dyn LogStorage>, RunError> {
    match &config.storage.path {
        Some(path) => {
            info!(path = %path.display(), "Opening log storage");
            Ok(Arc::new(DuckDbStorage::new(path)?))
        }
        None => {
            warn!("No storage path configured, logs are kept in memory only");
            Ok(Arc::new(match config.storage.max_records {
                Some(max_records) => InMemoryStorage::with_capacity(max_records),
                None => InMemoryStorage::new(),
            }))
        }
    }
}

fn open_settings(config: &Config) -> Result<Arc<dyn SettingsStore>, RunError> {
    match &config.storage.settings_path {
        Some(path) => Ok(Arc::new(JsonFileSettings::open(path)?)),
        None => Ok(Arc::new(InMemorySettings::new())),
    }
}

async fn read_until_interrupted<R>(
    reader: R,
    units: &HashMap<String, crate::channel::ChannelUnitHandle>,
    default_group: &str,
) -> Result<usize, RunError>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        result = enqueue_lines(reader, units, default_group) => result,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(0)
        }
    }
}

/// Enqueue every line of `reader`. Malformed lines are skipped with a warning.
pub async fn enqueue_lines<R>(
    reader: R,
    units: &HashMap<String, crate::channel::ChannelUnitHandle>,
    default_group: &str,
) -> Result<usize, RunError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0usize;
    let mut enqueued = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record = match InputRecord::parse(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping malformed record");
                continue;
            }
        };

        let (group, log, flags) = record.into_log();
        let group = group.unwrap_or_else(|| default_group.to_string());
        match units.get(&group) {
            Some(unit) => {
                unit.enqueue(log, flags);
                enqueued += 1;
            }
            None => warn!(line = line_number, group = %group, "Skipping record for unknown channel"),
        }
    }

    Ok(enqueued)
}

/// Wait until no unit has a batch in flight, or the drain timeout passes.
async fn drain(handle: &ChannelGroupHandle, config: &Config) -> Result<(), RunError> {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

    loop {
        handle.sync().await?;

        let mut in_flight = 0;
        for channel in &config.channels {
            if let Some(stats) = handle.unit_stats(&channel.group_id).await? {
                in_flight += stats.pending_batch_ids.len();
            }
        }

        if in_flight == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(in_flight, "Timed out waiting for in-flight batches; they stay stored for the next run");
            return Ok(());
        }
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}
