use super::traits::{LogSender, SendError, SendOutcome, SendRequest, SuspensionSignal};
use crate::config::types::IngestionConfig;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

const API_PATH: &str = "/logs?api-version=1.0.0";

/// How an HTTP status should be treated by the channel pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Recoverable,
    Fatal,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        // auth failures wait for a fresh token rather than dropping data
        401 | 403 | 408 | 429 => StatusClass::Recoverable,
        500..=599 => StatusClass::Recoverable,
        _ => StatusClass::Fatal,
    }
}

/// Sender posting batch containers to an ingestion endpoint over HTTP.
#[derive(Debug)]
pub struct HttpSender {
    client: reqwest::Client,
    endpoint: String,
    app_secret: String,
    install_id: Uuid,
    retry_intervals: Vec<Duration>,
    enabled: AtomicBool,
    suspension: SuspensionSignal,
}

impl HttpSender {
    pub fn new(config: &IngestionConfig, install_id: Uuid) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SendError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", config.url.trim_end_matches('/'), API_PATH),
            app_secret: config.app_secret.clone(),
            install_id,
            retry_intervals: config.retry_intervals.clone(),
            enabled: AtomicBool::new(config.enabled),
            suspension: SuspensionSignal::default(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Network reachability signal: while suspended no request is issued.
    pub fn set_suspended(&self, suspended: bool) {
        if self.suspension.set(suspended) {
            debug!(suspended, "HTTP sender suspension changed");
        }
    }

    fn headers(&self) -> Result<HeaderMap, SendError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "App-Secret",
            HeaderValue::from_str(&self.app_secret)
                .map_err(|e| SendError::InvalidRequest(e.to_string()))?,
        );
        headers.insert(
            "Install-ID",
            HeaderValue::from_str(&self.install_id.to_string())
                .map_err(|e| SendError::InvalidRequest(e.to_string()))?,
        );
        Ok(headers)
    }

    async fn send_once(&self, request: &SendRequest) -> SendOutcome {
        let headers = match self.headers() {
            Ok(headers) => headers,
            Err(e) => return SendOutcome::Fatal(e),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .body(request.payload.clone())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return SendOutcome::Recoverable(SendError::Timeout),
            Err(e) if e.is_builder() => {
                return SendOutcome::Fatal(SendError::InvalidRequest(e.to_string()))
            }
            Err(e) => return SendOutcome::Recoverable(SendError::Transport(e.to_string())),
        };

        let status = response.status().as_u16();
        match classify_status(status) {
            StatusClass::Success => SendOutcome::Success,
            class => {
                let error = SendError::Status {
                    status,
                    message: response.text().await.unwrap_or_default(),
                };
                if class == StatusClass::Recoverable {
                    SendOutcome::Recoverable(error)
                } else {
                    SendOutcome::Fatal(error)
                }
            }
        }
    }
}

#[async_trait]
impl LogSender for HttpSender {
    async fn send(&self, request: SendRequest) -> SendOutcome {
        let mut attempt = 0;

        loop {
            if !self.enabled.load(Ordering::SeqCst) {
                return SendOutcome::Recoverable(SendError::Disabled);
            }
            if self.suspension.get() {
                return SendOutcome::Recoverable(SendError::Suspended);
            }

            let error = match self.send_once(&request).await {
                SendOutcome::Recoverable(error) => error,
                outcome => return outcome,
            };

            let Some(interval) = self.retry_intervals.get(attempt) else {
                return SendOutcome::Recoverable(error);
            };

            warn!(
                group_id = %request.group_id,
                batch_id = %request.batch_id,
                attempt = attempt + 1,
                retry_in = ?interval,
                error = %error,
                "Batch send failed, retrying"
            );
            tokio::time::sleep(*interval).await;
            attempt += 1;
        }
    }

    fn is_suspended(&self) -> bool {
        self.suspension.get()
    }

    fn subscribe_suspension(&self) -> watch::Receiver<bool> {
        self.suspension.subscribe()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
