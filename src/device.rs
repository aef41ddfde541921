use serde::{Deserialize, Serialize};

/// Read-only snapshot of the device/process a batch originates from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub sdk_name: String,
    pub sdk_version: String,
    pub os_name: String,
    pub os_arch: String,
    pub host_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl DeviceInfo {
    /// Collect the snapshot once, at wiring time.
    pub fn collect() -> Self {
        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| s.to_string()));

        let locale = std::env::var("LANG")
            .ok()
            .map(|lang| lang.split('.').next().unwrap_or_default().to_string())
            .filter(|lang| !lang.is_empty());

        Self {
            sdk_name: env!("CARGO_PKG_NAME").to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            os_name: std::env::consts::OS.to_string(),
            os_arch: std::env::consts::ARCH.to_string(),
            host_name,
            app_version: None,
            locale,
        }
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }
}
