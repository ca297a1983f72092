//! Bluetooth transports
//!
//! Bluetooth Classic (RFCOMM serial link) and BLE links via BlueZ. The
//! Classic path matches how the watch exposes its serial service; the BLE
//! path holds the GATT-level link up and watches for it dropping.

use super::{ConnectOutcome, ConnectionFailureReason, DisconnectReason, TransportConnector};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Address, Session};
use std::str::FromStr;
use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Default timeout for Bluetooth connect operations
const BT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// RFCOMM channel the watch serial service listens on
const RFCOMM_CHANNEL: u8 = 1;

/// Interval for polling BLE link liveness
const BLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Map a BlueZ error to a terminal failure reason
fn classify_bluer_error<E: std::fmt::Display>(e: &E, default: ConnectionFailureReason) -> ConnectionFailureReason {
    let msg = e.to_string().to_ascii_lowercase();
    if msg.contains("authentication") || msg.contains("bonding") || msg.contains("pairing") {
        ConnectionFailureReason::PairingFailed
    } else if msg.contains("timeout") || msg.contains("timed out") {
        ConnectionFailureReason::ConnectTimeout
    } else {
        default
    }
}

fn publish_once(tx: &watch::Sender<Option<DisconnectReason>>, reason: DisconnectReason) {
    tx.send_modify(|current| {
        if current.is_none() {
            *current = Some(reason);
        }
    });
}

async fn await_disconnect(tx: &watch::Sender<Option<DisconnectReason>>) -> DisconnectReason {
    let mut rx = tx.subscribe();
    loop {
        if let Some(reason) = *rx.borrow() {
            return reason;
        }
        if rx.changed().await.is_err() {
            return DisconnectReason::TransportError;
        }
    }
}

/// Bluetooth Classic transport over an RFCOMM serial link
pub struct RfcommTransport {
    address: String,
    channel: u8,
    connect_timeout: Duration,
    disconnected_tx: watch::Sender<Option<DisconnectReason>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl RfcommTransport {
    pub fn new(address: String) -> Self {
        let (disconnected_tx, _) = watch::channel(None);
        Self {
            address,
            channel: RFCOMM_CHANNEL,
            connect_timeout: BT_CONNECT_TIMEOUT,
            disconnected_tx,
            monitor: Mutex::new(None),
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

#[async_trait]
impl TransportConnector for RfcommTransport {
    async fn connect(&self, _last_failure: Option<ConnectionFailureReason>) -> ConnectOutcome {
        debug!("Connecting RFCOMM to {} channel {}", self.address, self.channel);
        self.disconnected_tx.send_replace(None);

        let bt_addr = match Address::from_str(&self.address) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid Classic address '{}': {}", self.address, e);
                return ConnectOutcome::Failed(ConnectionFailureReason::UnresolvedIdentity);
            }
        };

        let socket_addr = SocketAddr::new(bt_addr, self.channel);
        let stream = match timeout(self.connect_timeout, Stream::connect(socket_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("RFCOMM connect to {} failed: {}", self.address, e);
                return ConnectOutcome::Failed(classify_bluer_error(
                    &e,
                    ConnectionFailureReason::RadioError,
                ));
            }
            Err(_) => {
                warn!("RFCOMM connect to {} timed out", self.address);
                return ConnectOutcome::Failed(ConnectionFailureReason::ConnectTimeout);
            }
        };

        info!("RFCOMM link up to {}", self.address);

        let disconnected_tx = self.disconnected_tx.clone();
        let address = self.address.clone();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            let mut buf = [0u8; 512];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => {
                        debug!("RFCOMM link to {} closed by watch", address);
                        publish_once(&disconnected_tx, DisconnectReason::RemoteClosed);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("RFCOMM link to {} error: {}", address, e);
                        publish_once(&disconnected_tx, DisconnectReason::TransportError);
                        break;
                    }
                }
            }
        });

        let mut monitor = self.monitor.lock().await;
        *monitor = Some(handle);

        ConnectOutcome::Success
    }

    async fn disconnect(&self) {
        let mut monitor = self.monitor.lock().await;
        if let Some(handle) = monitor.take() {
            handle.abort();
            info!("RFCOMM link to {} disconnected", self.address);
        }
        publish_once(&self.disconnected_tx, DisconnectReason::Requested);
    }

    async fn disconnected(&self) -> DisconnectReason {
        await_disconnect(&self.disconnected_tx).await
    }
}

/// BLE transport holding up the GATT-level link
pub struct BleTransport {
    address: String,
    connect_timeout: Duration,
    disconnected_tx: watch::Sender<Option<DisconnectReason>>,
    link: Mutex<Option<BleLink>>,
}

struct BleLink {
    device: bluer::Device,
    monitor: JoinHandle<()>,
}

impl BleTransport {
    pub fn new(address: String) -> Self {
        let (disconnected_tx, _) = watch::channel(None);
        Self {
            address,
            connect_timeout: BT_CONNECT_TIMEOUT,
            disconnected_tx,
            link: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TransportConnector for BleTransport {
    async fn connect(&self, _last_failure: Option<ConnectionFailureReason>) -> ConnectOutcome {
        debug!("Connecting BLE link to {}", self.address);
        self.disconnected_tx.send_replace(None);

        let bt_addr = match Address::from_str(&self.address) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid BLE address '{}': {}", self.address, e);
                return ConnectOutcome::Failed(ConnectionFailureReason::UnresolvedIdentity);
            }
        };

        let session = match Session::new().await {
            Ok(session) => session,
            Err(e) => {
                warn!("BlueZ session unavailable: {}", e);
                return ConnectOutcome::Failed(ConnectionFailureReason::RadioError);
            }
        };
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("No Bluetooth adapter: {}", e);
                return ConnectOutcome::Failed(ConnectionFailureReason::RadioError);
            }
        };

        // A device BlueZ has never seen cannot be connected; the stale
        // record has to be re-discovered by a scan.
        let device = match adapter.device(bt_addr) {
            Ok(device) => device,
            Err(e) => {
                warn!("BLE device {} not resolvable: {}", self.address, e);
                return ConnectOutcome::Failed(ConnectionFailureReason::UnresolvedIdentity);
            }
        };

        match timeout(self.connect_timeout, device.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("BLE connect to {} failed: {}", self.address, e);
                return ConnectOutcome::Failed(classify_bluer_error(
                    &e,
                    ConnectionFailureReason::GattError,
                ));
            }
            Err(_) => {
                warn!("BLE connect to {} timed out", self.address);
                return ConnectOutcome::Failed(ConnectionFailureReason::ConnectTimeout);
            }
        }

        info!("BLE link up to {}", self.address);

        let disconnected_tx = self.disconnected_tx.clone();
        let address = self.address.clone();
        let poll_device = device.clone();
        let monitor = tokio::spawn(async move {
            loop {
                sleep(BLE_POLL_INTERVAL).await;
                match poll_device.is_connected().await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("BLE link to {} dropped", address);
                        publish_once(&disconnected_tx, DisconnectReason::RemoteClosed);
                        break;
                    }
                    Err(e) => {
                        debug!("BLE liveness check for {} failed: {}", address, e);
                        publish_once(&disconnected_tx, DisconnectReason::TransportError);
                        break;
                    }
                }
            }
        });

        let mut link = self.link.lock().await;
        *link = Some(BleLink { device, monitor });

        ConnectOutcome::Success
    }

    async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if let Some(BleLink { device, monitor }) = link.take() {
            monitor.abort();
            if let Err(e) = device.disconnect().await {
                warn!("BLE disconnect from {} failed: {}", self.address, e);
            } else {
                info!("BLE link to {} disconnected", self.address);
            }
        }
        publish_once(&self.disconnected_tx, DisconnectReason::Requested);
    }

    async fn disconnected(&self) -> DisconnectReason {
        await_disconnect(&self.disconnected_tx).await
    }
}
