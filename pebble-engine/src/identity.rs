//! Watch identity and scan sightings
//!
//! A `PebbleIdentifier` is the opaque, transport-typed identity used as the
//! map key throughout the engine. It is immutable for the lifetime of a
//! watch record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport-typed watch identity
///
/// The ordering derived here is what gives reconciliation passes their
/// deterministic per-pass iteration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "transport", content = "address", rename_all = "lowercase")]
pub enum PebbleIdentifier {
    /// Bluetooth LE device address
    Ble(String),

    /// Bluetooth Classic MAC address
    Classic(String),

    /// Socket transport identity (emulator / tests), host:port or a label
    Socket(String),
}

impl PebbleIdentifier {
    /// The raw address/label without the transport prefix
    pub fn address(&self) -> &str {
        match self {
            PebbleIdentifier::Ble(a) => a,
            PebbleIdentifier::Classic(a) => a,
            PebbleIdentifier::Socket(a) => a,
        }
    }

    /// Whether this identifier names a BLE link
    pub fn is_ble(&self) -> bool {
        matches!(self, PebbleIdentifier::Ble(_))
    }

    /// Whether this identifier names a Bluetooth Classic link
    pub fn is_classic(&self) -> bool {
        matches!(self, PebbleIdentifier::Classic(_))
    }
}

impl std::fmt::Display for PebbleIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PebbleIdentifier::Ble(a) => write!(f, "ble:{}", a),
            PebbleIdentifier::Classic(a) => write!(f, "classic:{}", a),
            PebbleIdentifier::Socket(a) => write!(f, "socket:{}", a),
        }
    }
}

/// One sighting of a watch in a Bluetooth scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Identity the advertisement resolved to
    pub identifier: PebbleIdentifier,

    /// Advertised device name
    pub name: String,

    /// Signal strength at observation, if reported
    pub rssi: Option<i16>,

    /// When the advertisement was observed
    pub seen_at: DateTime<Utc>,
}

impl ScanResult {
    /// Create a scan result observed now
    pub fn new(identifier: PebbleIdentifier, name: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            identifier,
            name: name.into(),
            rssi,
            seen_at: Utc::now(),
        }
    }
}
