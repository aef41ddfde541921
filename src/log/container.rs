use super::Log;
use crate::device::DeviceInfo;
use serde::{Deserialize, Serialize};

/// The unit of transmission: one batch of logs for one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogContainer {
    pub batch_id: String,
    pub group_id: String,
    pub device: DeviceInfo,
    pub logs: Vec<Log>,
}

impl LogContainer {
    pub fn new(batch_id: String, group_id: String, device: DeviceInfo, logs: Vec<Log>) -> Self {
        Self {
            batch_id,
            group_id,
            device,
            logs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_container_serializes_batch() {
        let container = LogContainer::new(
            "batch-1".to_string(),
            "analytics".to_string(),
            DeviceInfo::default(),
            vec![Log::new("event", json!({"name": "click"}))],
        );

        let bytes = container.to_bytes().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded["batch_id"], "batch-1");
        assert_eq!(decoded["group_id"], "analytics");
        assert_eq!(decoded["logs"][0]["payload"]["name"], "click");
    }
}
