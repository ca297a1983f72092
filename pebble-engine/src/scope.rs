//! Per-connection resource scope
//!
//! A `ConnectionScope` bundles the per-connection singletons (protocol
//! runner handle, the service set, live telemetry) that are created fresh
//! for each connection attempt and torn down as a unit. Teardown is
//! idempotent: however many paths race into `close`, the release runs once.

use crate::error::{EngineError, Result};
use crate::identity::PebbleIdentifier;
use crate::negotiation::ConnectedMode;
use crate::watch::{FirmwareUpdateStatus, LanguagePackState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Send/receive handle for the protocol runner of one connection
///
/// Only the `Connected` device projection exposes this; wire framing is the
/// runner's concern, not the engine's.
#[derive(Debug, Clone)]
pub struct ProtocolHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: broadcast::Sender<Vec<u8>>,
}

impl ProtocolHandle {
    /// Create a handle plus the runner-side outbound receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(64);
        (Self { outbound, inbound }, outbound_rx)
    }

    /// Queue a frame for the watch
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| EngineError::Transport("protocol runner gone".to_string()))
    }

    /// Subscribe to frames received from the watch
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inbound.subscribe()
    }

    /// Runner-side: publish a frame received from the watch
    pub fn publish_inbound(&self, frame: Vec<u8>) {
        let _ = self.inbound.send(frame);
    }
}

/// One per-connection service (blob sync, timeline, voice, ...)
///
/// Services are started in a fixed order so each can assume its
/// dependencies are already running, and stopped in reverse.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) {}
}

/// Live per-connection telemetry published by scope services
pub struct ScopeTelemetry {
    battery: watch::Sender<Option<u8>>,
    firmware_update_available: watch::Sender<bool>,
    firmware_update_status: watch::Sender<FirmwareUpdateStatus>,
    language_pack: watch::Sender<LanguagePackState>,
}

impl Default for ScopeTelemetry {
    fn default() -> Self {
        let (battery, _) = watch::channel(None);
        let (firmware_update_available, _) = watch::channel(false);
        let (firmware_update_status, _) = watch::channel(FirmwareUpdateStatus::Idle);
        let (language_pack, _) = watch::channel(LanguagePackState::Idle);
        Self {
            battery,
            firmware_update_available,
            firmware_update_status,
            language_pack,
        }
    }
}

impl ScopeTelemetry {
    pub fn set_battery(&self, percent: Option<u8>) {
        let _ = self.battery.send(percent);
    }

    pub fn set_firmware_update_available(&self, available: bool) {
        let _ = self.firmware_update_available.send(available);
    }

    pub fn set_firmware_update_status(&self, status: FirmwareUpdateStatus) {
        let _ = self.firmware_update_status.send(status);
    }

    pub fn set_language_pack(&self, state: LanguagePackState) {
        let _ = self.language_pack.send(state);
    }

    pub fn battery_rx(&self) -> watch::Receiver<Option<u8>> {
        self.battery.subscribe()
    }

    pub fn firmware_update_available_rx(&self) -> watch::Receiver<bool> {
        self.firmware_update_available.subscribe()
    }

    pub fn firmware_update_status_rx(&self) -> watch::Receiver<FirmwareUpdateStatus> {
        self.firmware_update_status.subscribe()
    }

    pub fn language_pack_rx(&self) -> watch::Receiver<LanguagePackState> {
        self.language_pack.subscribe()
    }
}

/// Inputs the factory needs to build a scope
#[derive(Debug, Clone)]
pub struct ScopeProperties {
    pub identifier: PebbleIdentifier,
}

/// The per-connection resource bundle
pub struct ConnectionScope {
    identifier: PebbleIdentifier,
    protocol: ProtocolHandle,
    normal_services: Vec<Arc<dyn ConnectionService>>,
    recovery_services: Vec<Arc<dyn ConnectionService>>,
    telemetry: ScopeTelemetry,
    started: Mutex<Vec<Arc<dyn ConnectionService>>>,
    closed: AtomicBool,
    close_hook: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ConnectionScope {
    pub fn new(
        identifier: PebbleIdentifier,
        protocol: ProtocolHandle,
        normal_services: Vec<Arc<dyn ConnectionService>>,
        recovery_services: Vec<Arc<dyn ConnectionService>>,
    ) -> Self {
        Self {
            identifier,
            protocol,
            normal_services,
            recovery_services,
            telemetry: ScopeTelemetry::default(),
            started: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_hook: std::sync::Mutex::new(None),
        }
    }

    /// Register a hook run exactly once when the scope closes
    pub fn set_close_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.close_hook.lock().unwrap() = Some(hook);
    }

    pub fn identifier(&self) -> &PebbleIdentifier {
        &self.identifier
    }

    pub fn protocol(&self) -> &ProtocolHandle {
        &self.protocol
    }

    pub fn telemetry(&self) -> &ScopeTelemetry {
        &self.telemetry
    }

    /// Start the service set for the negotiated mode, in declaration order
    pub async fn start_services(&self, mode: ConnectedMode) -> Result<()> {
        let services = match mode {
            ConnectedMode::Normal => &self.normal_services,
            ConnectedMode::Recovery => &self.recovery_services,
        };

        let mut started = self.started.lock().await;
        for service in services {
            debug!(
                "Starting service '{}' for {}",
                service.name(),
                self.identifier
            );
            service.start().await?;
            started.push(service.clone());
        }
        info!(
            "Started {} services for {} ({:?})",
            started.len(),
            self.identifier,
            mode
        );
        Ok(())
    }

    /// Whether the scope has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the bundle down; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut started = self.started.lock().await;
        for service in started.drain(..).rev() {
            debug!(
                "Stopping service '{}' for {}",
                service.name(),
                self.identifier
            );
            service.stop().await;
        }
        drop(started);

        let hook = self.close_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }

        info!("Connection scope for {} closed", self.identifier);
    }
}

/// DI boundary for all per-connection services
pub trait ConnectionScopeFactory: Send + Sync {
    fn create_scope(&self, props: ScopeProperties) -> ConnectionScope;
}

/// A named placeholder service; real behavior lives behind the DI boundary
struct ScopeService {
    name: &'static str,
}

#[async_trait]
impl ConnectionService for ScopeService {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self) -> Result<()> {
        debug!("Service '{}' ready", self.name);
        Ok(())
    }
}

/// Builds the standard service set
#[derive(Debug, Default)]
pub struct DefaultScopeFactory;

impl ConnectionScopeFactory for DefaultScopeFactory {
    fn create_scope(&self, props: ScopeProperties) -> ConnectionScope {
        let (protocol, outbound_rx) = ProtocolHandle::channel();

        // The default runner just drains the queue; the daemon swaps in a
        // real wire-protocol runner through this factory seam.
        let identifier = props.identifier.clone();
        tokio::spawn(async move {
            let mut outbound_rx = outbound_rx;
            while let Some(frame) = outbound_rx.recv().await {
                warn!(
                    "Dropping {}-byte frame for {}: no protocol runner attached",
                    frame.len(),
                    identifier
                );
            }
        });

        let normal: Vec<Arc<dyn ConnectionService>> = [
            "app-run-state",
            "blob-db-sync",
            "app-fetch",
            "timeline-actions",
            "music-control",
            "phone-control",
            "voice",
        ]
        .into_iter()
        .map(|name| Arc::new(ScopeService { name }) as Arc<dyn ConnectionService>)
        .collect();

        let recovery: Vec<Arc<dyn ConnectionService>> = ["firmware-recovery", "log-dump"]
            .into_iter()
            .map(|name| Arc::new(ScopeService { name }) as Arc<dyn ConnectionService>)
            .collect();

        ConnectionScope::new(props.identifier, protocol, normal, recovery)
    }
}
