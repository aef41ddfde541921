pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# COURIER CONFIGURATION
# =============================================================================
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/courier/config.yml
#   3. /etc/courier/config.yml
#
# Values may reference environment variables with $env{NAME}.

# =============================================================================
# INGESTION
# =============================================================================
ingestion:
  url: https://in.example.com
  app_secret: $env{COURIER_APP_SECRET}
  # Per-request timeout
  timeout: 30s
  # Delays between retries of a recoverable failure before the batch is
  # reported back to its channel
  retry_intervals: [10s, 5m, 20m]
  enabled: true

# =============================================================================
# STORAGE
# =============================================================================
storage:
  # Logs are persisted here before they are sent
  path: ~/.local/share/courier/logs.duckdb
  # Oldest non-critical logs are evicted past this many records
  max_records: 10000
  settings_path: ~/.local/share/courier/settings.json

# Resume sending this long after a recoverable failure suspended the channels.
# Omit to wait for an explicit resume.
recovery_interval: 1m

# =============================================================================
# CHANNELS
# =============================================================================
# One entry per log stream. Group ids must be unique and should not be reused
# for a different stream in a later release.
channels:
  - group_id: analytics
    priority: default
    batch_size_limit: 50
    pending_batches_limit: 3
    flush_interval: 3s

  - group_id: crashes
    priority: high
    batch_size_limit: 1
    pending_batches_limit: 6
    flush_interval: 1s
"#
    .to_string()
}
