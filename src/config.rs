use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{NimbusError, NimbusResult};

/// Node-wide configuration with JSON file support.
///
/// All fields default to values suitable for a single-process deployment;
/// a config file only needs to name the fields it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Capacity of the live log-message ring.
    #[serde(default = "default_message_buffer_capacity")]
    pub message_buffer_capacity: usize,

    /// Capacity of the change-event queue feeding the dispatcher.
    #[serde(default = "default_update_queue_capacity")]
    pub update_queue_capacity: usize,

    /// Capacity of each subscriber's private notification channel.
    #[serde(default = "default_subscriber_channel_capacity")]
    pub subscriber_channel_capacity: usize,

    /// Per-delivery timeout before the attempt counts as a failure.
    #[serde(default = "default_delivery_timeout", with = "duration_ms")]
    pub delivery_timeout: Duration,

    /// Consecutive delivery failures before a subscriber is dropped.
    #[serde(default = "default_max_delivery_failures")]
    pub max_delivery_failures: u32,

    /// Grace period for draining queued events at shutdown.
    #[serde(default = "default_shutdown_grace", with = "duration_ms")]
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            message_buffer_capacity: default_message_buffer_capacity(),
            update_queue_capacity: default_update_queue_capacity(),
            subscriber_channel_capacity: default_subscriber_channel_capacity(),
            delivery_timeout: default_delivery_timeout(),
            max_delivery_failures: default_max_delivery_failures(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &str) -> NimbusResult<Self> {
        from_file(path)
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> NimbusResult<T> {
    let file = File::open(path)
        .map_err(|e| NimbusError::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| NimbusError::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> NimbusResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| NimbusError::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_message_buffer_capacity() -> usize {
    1024
}
fn default_update_queue_capacity() -> usize {
    256
}
fn default_subscriber_channel_capacity() -> usize {
    32
}
fn default_delivery_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_max_delivery_failures() -> u32 {
    3
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.message_buffer_capacity, 1024);
        assert_eq!(config.max_delivery_failures, 3);
        assert_eq!(config.delivery_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: NodeConfig = from_str(r#"{"update_queue_capacity": 16}"#).unwrap();
        assert_eq!(config.update_queue_capacity, 16);
        assert_eq!(config.subscriber_channel_capacity, 32);
    }

    #[test]
    fn test_duration_roundtrip_as_millis() {
        let config: NodeConfig = from_str(r#"{"delivery_timeout": 1500}"#).unwrap();
        assert_eq!(config.delivery_timeout, Duration::from_millis(1500));

        let serialized = serde_json::to_string(&config).unwrap();
        assert!(serialized.contains("\"delivery_timeout\":1500"));
    }
}
