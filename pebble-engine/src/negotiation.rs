//! Post-link negotiation
//!
//! After the physical link is up, the negotiator drives the capability and
//! version exchange and yields a populated `WatchInfo`, or `None` on
//! failure. It also decides whether the watch comes up in recovery mode.

use crate::scope::ConnectionScope;
use crate::watch::{FirmwareVersion, KnownWatchProps};
use async_trait::async_trait;
use chrono::Utc;

/// Oldest firmware line the companion still fully supports; anything below
/// is handled as a recovery connection so it can be brought forward.
pub const MIN_SUPPORTED_FIRMWARE: FirmwareVersion = FirmwareVersion {
    major: 3,
    minor: 0,
    patch: 0,
    suffix: None,
    is_recovery: false,
};

/// Identity and capabilities retrieved during negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct WatchInfo {
    /// Model/advertised name reported by the watch
    pub name: String,

    /// Firmware currently running
    pub running_firmware: FirmwareVersion,

    /// Recovery firmware installed, if any
    pub recovery_firmware: Option<FirmwareVersion>,

    pub serial: String,
    pub hardware_platform: String,
    pub color: Option<String>,
    pub capabilities: Vec<String>,

    /// Classic MAC, when learned over a BLE connection
    pub classic_address: Option<String>,
}

impl WatchInfo {
    /// Snapshot the negotiated facts into the durable record shape
    pub fn to_known_props(&self) -> KnownWatchProps {
        KnownWatchProps {
            running_firmware: self.running_firmware.clone(),
            recovery_firmware: self.recovery_firmware.clone(),
            serial: self.serial.clone(),
            hardware_platform: self.hardware_platform.clone(),
            color: self.color.clone(),
            capabilities: self.capabilities.clone(),
            classic_address: self.classic_address.clone(),
            last_connected: Some(Utc::now()),
        }
    }
}

/// Drives the post-link handshake over the scope's system services
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Run the handshake; `None` means it failed
    async fn negotiate(&self, scope: &ConnectionScope) -> Option<WatchInfo>;
}

/// Policy inputs for the recovery decision
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryPolicy {
    /// Treat a missing recovery firmware as acceptable
    pub ignore_missing_recovery: bool,
}

/// How a negotiated connection comes up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedMode {
    Normal,
    Recovery,
}

/// Decide recovery vs. normal mode; first match wins
pub fn connected_mode(info: &WatchInfo, policy: RecoveryPolicy) -> ConnectedMode {
    if info.running_firmware.is_recovery {
        return ConnectedMode::Recovery;
    }
    if info.recovery_firmware.is_none() && !policy.ignore_missing_recovery {
        return ConnectedMode::Recovery;
    }
    if info.running_firmware < MIN_SUPPORTED_FIRMWARE {
        return ConnectedMode::Recovery;
    }
    ConnectedMode::Normal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(running: FirmwareVersion, recovery: Option<FirmwareVersion>) -> WatchInfo {
        WatchInfo {
            name: "Pebble Time".to_string(),
            running_firmware: running,
            recovery_firmware: recovery,
            serial: "Q302445E0123".to_string(),
            hardware_platform: "snowy_dvt".to_string(),
            color: None,
            capabilities: vec![],
            classic_address: None,
        }
    }

    #[test]
    fn test_running_recovery_firmware_wins() {
        let info = info(
            FirmwareVersion::recovery(3, 8, 2),
            Some(FirmwareVersion::recovery(3, 8, 2)),
        );
        assert_eq!(
            connected_mode(&info, RecoveryPolicy::default()),
            ConnectedMode::Recovery
        );
    }

    #[test]
    fn test_missing_recovery_firmware_forces_recovery() {
        let info = info(FirmwareVersion::new(4, 3, 1), None);
        assert_eq!(
            connected_mode(&info, RecoveryPolicy::default()),
            ConnectedMode::Recovery
        );
        // ...unless policy says to ignore it
        assert_eq!(
            connected_mode(
                &info,
                RecoveryPolicy {
                    ignore_missing_recovery: true
                }
            ),
            ConnectedMode::Normal
        );
    }

    #[test]
    fn test_old_firmware_forces_recovery() {
        let info = info(
            FirmwareVersion::new(2, 9, 1),
            Some(FirmwareVersion::recovery(2, 9, 0)),
        );
        assert_eq!(
            connected_mode(&info, RecoveryPolicy::default()),
            ConnectedMode::Recovery
        );
    }

    #[test]
    fn test_healthy_watch_is_normal() {
        let info = info(
            FirmwareVersion::new(4, 3, 1),
            Some(FirmwareVersion::recovery(3, 8, 2)),
        );
        assert_eq!(
            connected_mode(&info, RecoveryPolicy::default()),
            ConnectedMode::Normal
        );
    }

    #[test]
    fn test_snapshot_sets_last_connected() {
        let info = info(
            FirmwareVersion::new(4, 3, 1),
            Some(FirmwareVersion::recovery(3, 8, 2)),
        );
        let props = info.to_known_props();
        assert!(props.last_connected.is_some());
        assert_eq!(props.serial, "Q302445E0123");
    }
}
