//! Transport Abstraction
//!
//! A `TransportConnector` owns the physical link for one connection attempt:
//! it opens the link, closes it, and exposes completion of disconnection as
//! an awaitable event. One connector instance exists per attempt; the wire
//! protocol itself is not this layer's concern.

mod bluetooth;
mod socket;

pub use bluetooth::{BleTransport, RfcommTransport};
pub use socket::SocketTransport;

use crate::error::Result;
use crate::identity::PebbleIdentifier;
use async_trait::async_trait;
use std::sync::Arc;

/// Terminal reasons a connection attempt can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureReason {
    /// No attempt has been made yet
    NeverAttempted,

    /// The transport-level connect timed out
    ConnectTimeout,

    /// Radio-level failure (adapter missing, HCI error, socket refused)
    RadioError,

    /// GATT-level failure on a BLE link
    GattError,

    /// Pairing or bonding was rejected or lost
    PairingFailed,

    /// The post-link handshake failed or timed out
    NegotiationFailed,

    /// The platform could not resolve the identifier to a connectable handle
    UnresolvedIdentity,

    /// The link dropped after it had been established
    LinkLost,
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionFailureReason::NeverAttempted => "never attempted",
            ConnectionFailureReason::ConnectTimeout => "connect timeout",
            ConnectionFailureReason::RadioError => "radio error",
            ConnectionFailureReason::GattError => "gatt error",
            ConnectionFailureReason::PairingFailed => "pairing failed",
            ConnectionFailureReason::NegotiationFailed => "negotiation failed",
            ConnectionFailureReason::UnresolvedIdentity => "unresolved identity",
            ConnectionFailureReason::LinkLost => "link lost",
        };
        f.write_str(s)
    }
}

/// Result of a transport connect call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The physical link is up
    Success,

    /// The link could not be established
    Failed(ConnectionFailureReason),
}

/// Why a transport reported disconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Our side requested the disconnect
    Requested,

    /// The remote side closed the link
    RemoteClosed,

    /// The link failed underneath us
    TransportError,
}

/// Physical link ownership for one connection attempt
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open the physical link
    ///
    /// `last_failure` carries the previous attempt's terminal reason so a
    /// transport can vary its strategy (e.g. force re-bonding after a
    /// pairing failure).
    async fn connect(&self, last_failure: Option<ConnectionFailureReason>) -> ConnectOutcome;

    /// Close the physical link; safe to call in any state
    async fn disconnect(&self);

    /// Wait until the transport reports disconnection
    ///
    /// Multi-waiter safe: every caller observes the same completion. Pends
    /// forever if the link never came up; callers bound the wait themselves.
    async fn disconnected(&self) -> DisconnectReason;
}

/// Produces a fresh connector for each connection attempt
///
/// An `Err` here is an identity-resolution failure: the persisted identifier
/// can no longer be mapped to a connectable handle.
pub trait TransportFactory: Send + Sync {
    fn create(&self, identifier: &PebbleIdentifier) -> Result<Arc<dyn TransportConnector>>;
}

/// Default production factory mapping each identifier to its transport
#[derive(Debug, Default)]
pub struct StandardTransportFactory;

impl TransportFactory for StandardTransportFactory {
    fn create(&self, identifier: &PebbleIdentifier) -> Result<Arc<dyn TransportConnector>> {
        match identifier {
            PebbleIdentifier::Ble(addr) => Ok(Arc::new(BleTransport::new(addr.clone()))),
            PebbleIdentifier::Classic(addr) => Ok(Arc::new(RfcommTransport::new(addr.clone()))),
            PebbleIdentifier::Socket(addr) => Ok(Arc::new(SocketTransport::new(addr.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(
            ConnectionFailureReason::ConnectTimeout.to_string(),
            "connect timeout"
        );
        assert_eq!(
            ConnectionFailureReason::UnresolvedIdentity.to_string(),
            "unresolved identity"
        );
    }

    #[test]
    fn test_standard_factory_covers_all_transports() {
        let factory = StandardTransportFactory;
        for id in [
            PebbleIdentifier::Ble("00:11:22:33:44:55".to_string()),
            PebbleIdentifier::Classic("00:11:22:33:44:55".to_string()),
            PebbleIdentifier::Socket("127.0.0.1:47527".to_string()),
        ] {
            assert!(factory.create(&id).is_ok());
        }
    }
}
