//! Pebble Watch Connection Engine
//!
//! This library owns the canonical model of all known and discovered Pebble
//! watches and continuously reconciles declared connect goals against
//! reality: dialing transports, negotiating watch identity, managing
//! per-connection resources, persisting durable watch records and projecting
//! everything into a read-only device list.

pub mod adapter;
pub mod config;
pub mod connector;
pub mod identity;
pub mod manager;
pub mod negotiation;
pub mod projection;
pub mod registry;
pub mod scope;
pub mod transport;
pub mod watch;

mod error;

pub use adapter::{BluerAdapterWatcher, BluetoothState, BluetoothStateProvider, StaticBluetoothState};
pub use config::EngineConfig;
pub use connector::{ConnectingPebbleState, ConnectorHandle, PebbleConnector, SubStateUpdate};
pub use error::{EngineError, Result};
pub use identity::{PebbleIdentifier, ScanResult};
pub use manager::{ConnectionEvent, EngineDeps, WatchManager};
pub use negotiation::{
    connected_mode, ConnectedMode, Negotiator, RecoveryPolicy, WatchInfo, MIN_SUPPORTED_FIRMWARE,
};
pub use projection::{ActivePebbleState, PebbleDevice};
pub use registry::{JsonWatchRegistry, KnownWatchDao};
pub use scope::{
    ConnectionScope, ConnectionScopeFactory, ConnectionService, DefaultScopeFactory,
    ProtocolHandle, ScopeProperties, ScopeTelemetry,
};
pub use transport::{
    BleTransport, ConnectOutcome, ConnectionFailureReason, DisconnectReason, RfcommTransport,
    SocketTransport, StandardTransportFactory, TransportConnector, TransportFactory,
};
pub use watch::{
    ConnectionFailureInfo, FirmwareUpdateStatus, FirmwareVersion, KnownWatchProps,
    LanguagePackState, PersistedWatch,
};
