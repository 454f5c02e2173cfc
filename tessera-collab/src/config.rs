//! Realtime layer configuration.
//!
//! Constructed in code via `Default` or loaded from JSON with
//! [`RealtimeConfig::from_json_str`]. Missing JSON fields fall back to the
//! defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::ConfigError;

/// Channel manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Channel names are `"{channel_prefix}:{project_id}"`.
    pub channel_prefix: String,
    /// Capacity of each channel's inbound event queue.
    pub event_buffer: usize,
    /// Upper bound on opening a channel, and again on its subscribe acknowledgement.
    pub subscribe_timeout_ms: u64,
    /// Interval of the channel liveness probe (None = disabled).
    pub health_probe_interval_secs: Option<u64>,
    /// Upper bound on a single liveness ping.
    pub ping_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "project".to_string(),
            event_buffer: 256,
            subscribe_timeout_ms: 10_000,
            health_probe_interval_secs: Some(30),
            ping_timeout_ms: 5_000,
        }
    }
}

impl RealtimeConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RealtimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_prefix.trim().is_empty() {
            return Err(invalid("channel_prefix", "must not be empty"));
        }
        if self.channel_prefix.contains(':') {
            return Err(invalid("channel_prefix", "must not contain ':'"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer", "must be greater than 0"));
        }
        if self.subscribe_timeout_ms == 0 {
            return Err(invalid("subscribe_timeout_ms", "must be greater than 0"));
        }
        if self.ping_timeout_ms == 0 {
            return Err(invalid("ping_timeout_ms", "must be greater than 0"));
        }
        if self.health_probe_interval_secs == Some(0) {
            return Err(invalid(
                "health_probe_interval_secs",
                "must be greater than 0 (use null to disable)",
            ));
        }
        Ok(())
    }

    pub fn channel_name(&self, project_id: Uuid) -> String {
        format!("{}:{}", self.channel_prefix, project_id)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn health_probe_interval(&self) -> Option<Duration> {
        self.health_probe_interval_secs.map(Duration::from_secs)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}
