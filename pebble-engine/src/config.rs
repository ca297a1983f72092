//! Engine configuration
//!
//! TOML-backed configuration for the reconciliation engine. Every field has
//! a default so a missing or partial file still yields a working engine.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Allow connection attempts to more than one watch at a time
    #[serde(default = "default_false")]
    pub multiple_watches: bool,

    /// After connecting over BLE, redial over Bluetooth Classic once the
    /// watch's Classic MAC is known
    #[serde(default = "default_false")]
    pub prefer_classic: bool,

    /// Treat a watch with no recovery firmware as a normal connection
    /// instead of forcing recovery mode
    #[serde(default = "default_false")]
    pub ignore_missing_recovery: bool,

    /// Seconds allowed for the post-link negotiation
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Seconds to wait for the transport's own disconnect signal during
    /// teardown before giving up on it
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,

    /// Milliseconds to hold a torn-down attempt slot before it may be
    /// reused, absorbing watches that bounce disconnect/reconnect faster
    /// than the radio settles
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Seconds between Bluetooth adapter state polls
    #[serde(default = "default_adapter_poll")]
    pub adapter_poll_secs: u64,
}

fn default_false() -> bool {
    false
}

fn default_negotiation_timeout() -> u64 {
    20
}

fn default_disconnect_timeout() -> u64 {
    5
}

fn default_settle_delay() -> u64 {
    500
}

fn default_adapter_poll() -> u64 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            multiple_watches: false,
            prefer_classic: false,
            ignore_missing_recovery: false,
            negotiation_timeout_secs: default_negotiation_timeout(),
            disconnect_timeout_secs: default_disconnect_timeout(),
            settle_delay_ms: default_settle_delay(),
            adapter_poll_secs: default_adapter_poll(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, or defaults if it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Default config location under the platform config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pebbled")
            .join("config.toml")
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn adapter_poll_interval(&self) -> Duration {
        Duration::from_secs(self.adapter_poll_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(!config.multiple_watches);
        assert!(!config.prefer_classic);
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(20));
        assert_eq!(config.settle_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert!(!config.multiple_watches);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = EngineConfig::default();
        config.multiple_watches = true;
        config.settle_delay_ms = 0;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert!(loaded.multiple_watches);
        assert_eq!(loaded.settle_delay(), Duration::ZERO);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "multiple_watches = true\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert!(config.multiple_watches);
        assert_eq!(config.negotiation_timeout_secs, 20);
    }
}
