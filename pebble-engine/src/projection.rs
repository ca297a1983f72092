//! Device-list projection
//!
//! Each reconciliation pass rebuilds a read-only `PebbleDevice` for every
//! tracked watch from the manager's private state. The projection is
//! capability-typed: only a fully `Connected` device carries the protocol
//! handle, so consumers cannot send frames to a watch that is discovered,
//! connecting or in recovery.

use crate::connector::ConnectingPebbleState;
use crate::identity::{PebbleIdentifier, ScanResult};
use crate::negotiation::WatchInfo;
use crate::scope::ProtocolHandle;
use crate::watch::{
    ConnectionFailureInfo, FirmwareUpdateStatus, KnownWatchProps, LanguagePackState,
};
use tracing::warn;

/// Combined live sub-state of a connected watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivePebbleState {
    pub battery: Option<u8>,
    pub firmware_update_available: bool,
    pub firmware_update: FirmwareUpdateStatus,
    pub language_pack: LanguagePackState,
}

/// Read-only view of one watch, rebuilt per pass and never mutated
#[derive(Debug, Clone)]
pub enum PebbleDevice {
    /// Seen in a scan, never successfully connected
    Discovered {
        identifier: PebbleIdentifier,
        name: String,
        rssi: Option<i16>,
        last_failure: Option<ConnectionFailureInfo>,
    },

    /// Previously connected, currently disconnected
    Known {
        identifier: PebbleIdentifier,
        name: String,
        nickname: Option<String>,
        props: KnownWatchProps,
        connect_goal: bool,
        last_failure: Option<ConnectionFailureInfo>,
    },

    /// A connection attempt is underway (link or negotiation phase)
    Connecting {
        identifier: PebbleIdentifier,
        name: String,
        nickname: Option<String>,
    },

    /// Teardown of the previous attempt has not finished yet
    Disconnecting {
        identifier: PebbleIdentifier,
        name: String,
        nickname: Option<String>,
    },

    /// Connected in recovery mode; firmware installation only, no
    /// application protocol access
    ConnectedInRecovery {
        identifier: PebbleIdentifier,
        name: String,
        nickname: Option<String>,
        info: WatchInfo,
        active: ActivePebbleState,
    },

    /// Fully connected and negotiated
    Connected {
        identifier: PebbleIdentifier,
        name: String,
        nickname: Option<String>,
        info: WatchInfo,
        active: ActivePebbleState,
        protocol: ProtocolHandle,
    },
}

impl PebbleDevice {
    pub fn identifier(&self) -> &PebbleIdentifier {
        match self {
            PebbleDevice::Discovered { identifier, .. }
            | PebbleDevice::Known { identifier, .. }
            | PebbleDevice::Connecting { identifier, .. }
            | PebbleDevice::Disconnecting { identifier, .. }
            | PebbleDevice::ConnectedInRecovery { identifier, .. }
            | PebbleDevice::Connected { identifier, .. } => identifier,
        }
    }

    /// Name shown to the user; nickname wins where one is set
    pub fn display_name(&self) -> &str {
        match self {
            PebbleDevice::Discovered { name, .. } => name,
            PebbleDevice::Known { name, nickname, .. }
            | PebbleDevice::Connecting { name, nickname, .. }
            | PebbleDevice::Disconnecting { name, nickname, .. }
            | PebbleDevice::ConnectedInRecovery { name, nickname, .. }
            | PebbleDevice::Connected { name, nickname, .. } => {
                nickname.as_deref().unwrap_or(name)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            PebbleDevice::Connected { .. } | PebbleDevice::ConnectedInRecovery { .. }
        )
    }

    /// Protocol access; present only on a fully connected device
    pub fn protocol(&self) -> Option<&ProtocolHandle> {
        match self {
            PebbleDevice::Connected { protocol, .. } => Some(protocol),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PebbleDevice::Discovered { .. } => "discovered",
            PebbleDevice::Known { .. } => "known",
            PebbleDevice::Connecting { .. } => "connecting",
            PebbleDevice::Disconnecting { .. } => "disconnecting",
            PebbleDevice::ConnectedInRecovery { .. } => "connected-recovery",
            PebbleDevice::Connected { .. } => "connected",
        }
    }
}

/// Everything the projection may draw on for one watch
pub struct ProjectionInputs<'a> {
    pub identifier: &'a PebbleIdentifier,
    pub scan_result: Option<&'a ScanResult>,
    pub name: Option<&'a str>,
    pub nickname: Option<&'a str>,
    pub known_props: Option<&'a KnownWatchProps>,
    pub connect_goal: bool,
    /// State of the running attempt, if one exists
    pub attempt_state: Option<&'a ConnectingPebbleState>,
    /// The attempt slot is still held (teardown not yet complete)
    pub attempt_outstanding: bool,
    pub last_failure: Option<ConnectionFailureInfo>,
    pub protocol: Option<&'a ProtocolHandle>,
    pub active: ActivePebbleState,
}

impl ProjectionInputs<'_> {
    fn resolved_name(&self) -> String {
        self.name
            .map(str::to_string)
            .or_else(|| self.scan_result.map(|s| s.name.clone()))
            .unwrap_or_else(|| self.identifier.to_string())
    }
}

/// Build the device view for one watch; pure, total over its inputs
///
/// Anything contradictory degrades to the least-capable variant rather
/// than erroring, so a transient inconsistency mid-pass can never hand a
/// consumer more capability than the watch really has.
pub fn project(inputs: ProjectionInputs<'_>) -> PebbleDevice {
    let identifier = inputs.identifier.clone();
    let name = inputs.resolved_name();
    let nickname = inputs.nickname.map(str::to_string);

    match inputs.attempt_state {
        Some(ConnectingPebbleState::Connected(info)) => {
            if let Some(protocol) = inputs.protocol {
                return PebbleDevice::Connected {
                    identifier,
                    name,
                    nickname,
                    info: info.clone(),
                    active: inputs.active,
                    protocol: protocol.clone(),
                };
            }
            // Connected without a scope handle is a mid-pass inconsistency
            warn!("{} reported connected before its scope was seen", identifier);
            return PebbleDevice::Connecting {
                identifier,
                name,
                nickname,
            };
        }
        Some(ConnectingPebbleState::ConnectedInRecovery(info)) => {
            return PebbleDevice::ConnectedInRecovery {
                identifier,
                name,
                nickname,
                info: info.clone(),
                active: inputs.active,
            };
        }
        Some(ConnectingPebbleState::Connecting) | Some(ConnectingPebbleState::Negotiating) => {
            return PebbleDevice::Connecting {
                identifier,
                name,
                nickname,
            };
        }
        Some(ConnectingPebbleState::Inactive)
        | Some(ConnectingPebbleState::Failed(_))
        | None => {}
    }

    // No live connection. A still-outstanding slot with the goal withdrawn
    // is teardown in flight.
    if inputs.attempt_outstanding && !inputs.connect_goal {
        return PebbleDevice::Disconnecting {
            identifier,
            name,
            nickname,
        };
    }

    if let Some(props) = inputs.known_props {
        return PebbleDevice::Known {
            identifier,
            name,
            nickname,
            props: props.clone(),
            connect_goal: inputs.connect_goal,
            last_failure: inputs.last_failure,
        };
    }

    // Least-capable fallback, also taken when a record has neither a scan
    // result nor known props.
    PebbleDevice::Discovered {
        rssi: inputs.scan_result.and_then(|s| s.rssi),
        identifier,
        name,
        last_failure: inputs.last_failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::FirmwareVersion;
    use chrono::Utc;

    fn socket_id() -> PebbleIdentifier {
        PebbleIdentifier::Socket("emulator".to_string())
    }

    fn base_inputs(identifier: &PebbleIdentifier) -> ProjectionInputs<'_> {
        ProjectionInputs {
            identifier,
            scan_result: None,
            name: None,
            nickname: None,
            known_props: None,
            connect_goal: false,
            attempt_state: None,
            attempt_outstanding: false,
            last_failure: None,
            protocol: None,
            active: ActivePebbleState::default(),
        }
    }

    fn info() -> WatchInfo {
        WatchInfo {
            name: "Pebble Time".to_string(),
            running_firmware: FirmwareVersion::new(4, 3, 1),
            recovery_firmware: Some(FirmwareVersion::recovery(3, 8, 2)),
            serial: "Q302445E0123".to_string(),
            hardware_platform: "snowy_dvt".to_string(),
            color: None,
            capabilities: vec![],
            classic_address: None,
        }
    }

    fn props() -> KnownWatchProps {
        info().to_known_props()
    }

    #[test]
    fn test_empty_record_projects_discovered() {
        let id = socket_id();
        let device = project(base_inputs(&id));
        assert!(matches!(device, PebbleDevice::Discovered { .. }));
        assert_eq!(device.display_name(), "socket:emulator");
    }

    #[test]
    fn test_scan_result_projects_discovered_with_name() {
        let id = socket_id();
        let scan = ScanResult {
            identifier: id.clone(),
            name: "Pebble 1F2A".to_string(),
            rssi: Some(-60),
            seen_at: Utc::now(),
        };
        let mut inputs = base_inputs(&id);
        inputs.scan_result = Some(&scan);

        let device = project(inputs);
        assert_eq!(device.display_name(), "Pebble 1F2A");
        match device {
            PebbleDevice::Discovered { rssi, .. } => assert_eq!(rssi, Some(-60)),
            other => panic!("expected Discovered, got {}", other.label()),
        }
    }

    #[test]
    fn test_known_props_project_known() {
        let id = socket_id();
        let props = props();
        let mut inputs = base_inputs(&id);
        inputs.known_props = Some(&props);
        inputs.name = Some("Pebble Time");
        inputs.nickname = Some("Daily driver");

        let device = project(inputs);
        assert!(matches!(device, PebbleDevice::Known { .. }));
        assert_eq!(device.display_name(), "Daily driver");
    }

    #[test]
    fn test_attempt_states_project_connecting() {
        let id = socket_id();
        for state in [ConnectingPebbleState::Connecting, ConnectingPebbleState::Negotiating] {
            let mut inputs = base_inputs(&id);
            inputs.attempt_state = Some(&state);
            inputs.connect_goal = true;
            assert!(matches!(project(inputs), PebbleDevice::Connecting { .. }));
        }
    }

    #[test]
    fn test_connected_requires_protocol_handle() {
        let id = socket_id();
        let state = ConnectingPebbleState::Connected(info());

        // Without the scope's handle the projection degrades
        let mut inputs = base_inputs(&id);
        inputs.attempt_state = Some(&state);
        assert!(matches!(project(inputs), PebbleDevice::Connecting { .. }));

        let (protocol, _rx) = ProtocolHandle::channel();
        let mut inputs = base_inputs(&id);
        inputs.attempt_state = Some(&state);
        inputs.protocol = Some(&protocol);
        let device = project(inputs);
        assert!(matches!(device, PebbleDevice::Connected { .. }));
        assert!(device.protocol().is_some());
    }

    #[test]
    fn test_recovery_connection_exposes_no_protocol() {
        let id = socket_id();
        let state = ConnectingPebbleState::ConnectedInRecovery(info());
        let (protocol, _rx) = ProtocolHandle::channel();

        let mut inputs = base_inputs(&id);
        inputs.attempt_state = Some(&state);
        inputs.protocol = Some(&protocol);

        let device = project(inputs);
        assert!(matches!(device, PebbleDevice::ConnectedInRecovery { .. }));
        assert!(device.protocol().is_none());
    }

    #[test]
    fn test_outstanding_slot_without_goal_projects_disconnecting() {
        let id = socket_id();
        let props = props();
        let mut inputs = base_inputs(&id);
        inputs.known_props = Some(&props);
        inputs.attempt_outstanding = true;
        inputs.connect_goal = false;

        assert!(matches!(project(inputs), PebbleDevice::Disconnecting { .. }));
    }

    #[test]
    fn test_failed_attempt_with_goal_projects_known_with_failure() {
        let id = socket_id();
        let props = props();
        let state = ConnectingPebbleState::Failed(
            crate::transport::ConnectionFailureReason::ConnectTimeout,
        );
        let mut inputs = base_inputs(&id);
        inputs.known_props = Some(&props);
        inputs.attempt_state = Some(&state);
        inputs.attempt_outstanding = true;
        inputs.connect_goal = true;
        inputs.last_failure = Some(ConnectionFailureInfo {
            reason: crate::transport::ConnectionFailureReason::ConnectTimeout,
            consecutive: 2,
        });

        match project(inputs) {
            PebbleDevice::Known { last_failure, .. } => {
                assert_eq!(last_failure.unwrap().consecutive, 2);
            }
            other => panic!("expected Known, got {}", other.label()),
        }
    }
}
