//! Configuration types
//!
//! Runtime configuration for the bridge itself.

use serde::{Deserialize, Serialize};

/// Bridge runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Maximum number of undelivered events buffered between the worker and the listener.
    /// A full channel blocks the producing engine.
    pub channel_capacity: usize,
    /// Name given to the background worker thread
    pub worker_thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            worker_thread_name: "llamabridge-worker".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.worker_thread_name, "llamabridge-worker");
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).expect("Failed to serialize");
        let deserialized: BridgeConfig = serde_json::from_str(&json).expect("Failed to deserialize");
        assert_eq!(config.channel_capacity, deserialized.channel_capacity);
    }
}
