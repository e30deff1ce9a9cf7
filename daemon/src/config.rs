//! Engine configuration
//!
//! Every tunable has a default; a JSON file may override any subset and
//! command-line flags override the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default retention of the closed-connection ring
pub const DEFAULT_CLOSED_BUFFER_CAPACITY: usize = 4096;

/// Default per-direction classifier buffer
pub const DEFAULT_CLASSIFIER_BUFFER_BYTES: usize = 512;

/// Default number of samples before a flow is abandoned
pub const DEFAULT_CLASSIFIER_MAX_SAMPLES: u32 = 8;

/// Default bound on pending TLS records and joins
pub const DEFAULT_TLS_MAX_PENDING: usize = 8192;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of closed-connection slots retained for clients
    pub closed_buffer_capacity: usize,
    /// Byte cap of each per-direction classification buffer
    pub classifier_buffer_bytes: usize,
    /// Samples accepted per flow before classification is abandoned
    pub classifier_max_samples: u32,
    /// Age after which a non-terminal classification is flushed
    #[serde(with = "duration")]
    pub classifier_deadline: Duration,
    /// How long a TLS record or tuple resolution waits for its counterpart
    #[serde(with = "duration")]
    pub tls_join_timeout: Duration,
    /// Upper bound on pending TLS records plus pending joins
    pub tls_max_pending: usize,
    /// Inactivity after which the sweeper closes a connection
    #[serde(with = "duration")]
    pub idle_timeout: Duration,
    /// How long a closed key keeps rejecting stale events
    #[serde(with = "duration")]
    pub tombstone_ttl: Duration,
    /// Upper bound on tombstones of sweeper-closed keys whose kernel close
    /// has not arrived yet
    #[serde(with = "duration")]
    pub orphan_tombstone_ttl: Duration,
    /// Sweeper period
    #[serde(with = "duration")]
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            closed_buffer_capacity: DEFAULT_CLOSED_BUFFER_CAPACITY,
            classifier_buffer_bytes: DEFAULT_CLASSIFIER_BUFFER_BYTES,
            classifier_max_samples: DEFAULT_CLASSIFIER_MAX_SAMPLES,
            classifier_deadline: Duration::from_secs(10),
            tls_join_timeout: Duration::from_secs(2),
            tls_max_pending: DEFAULT_TLS_MAX_PENDING,
            idle_timeout: Duration::from_secs(120),
            tombstone_ttl: Duration::from_secs(30),
            orphan_tombstone_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: EngineConfig =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("closed_buffer_capacity", self.closed_buffer_capacity),
            ("classifier_buffer_bytes", self.classifier_buffer_bytes),
            ("classifier_max_samples", self.classifier_max_samples as usize),
            ("tls_max_pending", self.tls_max_pending),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        let durations = [
            ("classifier_deadline", self.classifier_deadline),
            ("tls_join_timeout", self.tls_join_timeout),
            ("idle_timeout", self.idle_timeout),
            ("tombstone_ttl", self.tombstone_ttl),
            ("orphan_tombstone_ttl", self.orphan_tombstone_ttl),
            ("sweep_interval", self.sweep_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }
}

/// Durations are written in humantime form ("2s", "1m 30s") in config files
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
