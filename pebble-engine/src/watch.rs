//! Watch model types
//!
//! Durable and ephemeral records for one watch: the facts learned from a
//! successful negotiation, the snapshot written to storage, and the
//! per-connection sub-state enums.

use crate::identity::PebbleIdentifier;
use crate::transport::ConnectionFailureReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// A firmware version as reported during negotiation
///
/// Recovery (PRF) builds tag themselves with a `prf` suffix; the flag is
/// carried explicitly because the suffix alone is not authoritative on
/// older firmware lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    /// Build suffix, e.g. `prf` or `beta4`
    pub suffix: Option<String>,
    /// Whether the firmware reports itself as a recovery build
    pub is_recovery: bool,
}

impl FirmwareVersion {
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: None,
            is_recovery: false,
        }
    }

    pub fn recovery(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: Some("prf".to_string()),
            is_recovery: true,
        }
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{}", suffix)?;
        }
        Ok(())
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    /// Parse version tags of the form `v4.3.1` or `v3.8.2-prf`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let (numbers, suffix) = match s.split_once('-') {
            Some((n, suf)) => (n, Some(suf.to_string())),
            None => (s, None),
        };

        let mut parts = numbers.splitn(3, '.');
        let mut next = |name: &str| -> std::result::Result<u16, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {} component in '{}'", name, s))?
                .parse::<u16>()
                .map_err(|e| format!("bad {} component in '{}': {}", name, s, e))
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch").unwrap_or(0);
        let is_recovery = suffix.as_deref() == Some("prf");

        Ok(Self {
            major,
            minor,
            patch,
            suffix,
            is_recovery,
        })
    }
}

/// Durable facts learned after at least one successful connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownWatchProps {
    /// Firmware running at the last negotiation
    pub running_firmware: FirmwareVersion,

    /// Recovery firmware installed on the watch, if any
    pub recovery_firmware: Option<FirmwareVersion>,

    /// Watch serial number
    pub serial: String,

    /// Hardware platform string (e.g. "snowy_dvt")
    pub hardware_platform: String,

    /// Case color, if reported
    pub color: Option<String>,

    /// Capability strings advertised during negotiation
    pub capabilities: Vec<String>,

    /// Bluetooth Classic MAC, when learned over a BLE connection
    pub classic_address: Option<String>,

    /// When the watch was last successfully connected
    pub last_connected: Option<DateTime<Utc>>,
}

/// The snapshot of a watch written to durable storage
///
/// Compared against the last-written copy each reconciliation pass so that
/// unchanged watches cost no writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedWatch {
    pub identifier: PebbleIdentifier,
    pub name: String,
    pub nickname: Option<String>,
    pub props: KnownWatchProps,
}

/// Failure bookkeeping for one identifier
///
/// The count is consecutive occurrences of the same reason; a different
/// reason resets it to 1. Consumed by UI/backoff policy, not interpreted
/// by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionFailureInfo {
    pub reason: ConnectionFailureReason,
    pub consecutive: u32,
}

impl ConnectionFailureInfo {
    /// Fold a new terminal failure into the existing bookkeeping
    pub fn record(previous: Option<Self>, reason: ConnectionFailureReason) -> Self {
        match previous {
            Some(prev) if prev.reason == reason => Self {
                reason,
                consecutive: prev.consecutive + 1,
            },
            _ => Self {
                reason,
                consecutive: 1,
            },
        }
    }
}

/// Live firmware-update progress for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareUpdateStatus {
    #[default]
    Idle,
    Downloading(u8),
    Installing(u8),
    Succeeded,
    Failed,
}

/// Live language-pack install progress for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LanguagePackState {
    #[default]
    Idle,
    Installing(u8),
    Installed,
    Failed,
}
