//! Watch manager and reconciliation loop
//!
//! The `WatchManager` owns the canonical model of every known and
//! discovered watch. All inputs — imperative commands, adapter state,
//! per-attempt connection state, scope telemetry — are funneled into one
//! event queue consumed by a single loop task, so the watch map has exactly
//! one writer and needs no locking. Every event triggers a reconciliation
//! pass that pushes the world toward the declared connect goals and
//! republishes the device-list projection.

use crate::adapter::{BluetoothState, BluetoothStateProvider};
use crate::config::EngineConfig;
use crate::connector::{
    ConnectingPebbleState, ConnectorHandle, ConnectorParams, ConnectorSignal, ConnectorSignalKind,
    PebbleConnector, SubStateUpdate,
};
use crate::error::{EngineError, Result};
use crate::identity::{PebbleIdentifier, ScanResult};
use crate::negotiation::{Negotiator, RecoveryPolicy};
use crate::projection::{project, ActivePebbleState, PebbleDevice, ProjectionInputs};
use crate::registry::KnownWatchDao;
use crate::scope::{ConnectionScopeFactory, ProtocolHandle};
use crate::transport::{ConnectionFailureReason, TransportFactory};
use crate::watch::{ConnectionFailureInfo, FirmwareUpdateStatus, KnownWatchProps, PersistedWatch};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notable transitions, broadcast to observers
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        identifier: PebbleIdentifier,
        recovery: bool,
    },
    Disconnected {
        identifier: PebbleIdentifier,
    },
    AttemptFailed {
        identifier: PebbleIdentifier,
        failure: ConnectionFailureInfo,
    },
}

/// Production collaborators behind the engine's seams
pub struct EngineDeps {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub negotiator: Arc<dyn Negotiator>,
    pub scope_factory: Arc<dyn ConnectionScopeFactory>,
    pub dao: Arc<dyn KnownWatchDao>,
    pub bluetooth: Arc<dyn BluetoothStateProvider>,
}

enum Command {
    RequestConnection(PebbleIdentifier),
    RequestDisconnection(PebbleIdentifier),
    AddScanResult(ScanResult),
    ClearScanResults,
    Forget(PebbleIdentifier),
    SetNickname(PebbleIdentifier, Option<String>),
    DebugDump(oneshot::Sender<String>),
}

/// The live attempt slot for one watch
struct AttemptSlot {
    handle: ConnectorHandle,
    state: ConnectingPebbleState,
    protocol: Option<ProtocolHandle>,
    active: ActivePebbleState,
    disconnect_requested: bool,
}

/// Everything the manager tracks about one watch
struct WatchRecord {
    identifier: PebbleIdentifier,
    name: Option<String>,
    nickname: Option<String>,
    scan_result: Option<ScanResult>,
    known_props: Option<KnownWatchProps>,
    connect_goal: bool,
    /// Pending-deletion marker; the record and its durable copy drop once
    /// no attempt is outstanding
    forget: bool,
    last_failure: Option<ConnectionFailureInfo>,
    /// Cached from the live connection so it survives brief signal gaps
    firmware_update_available: bool,
    /// Final firmware-update status of the last connection, shown while
    /// disconnected
    last_firmware_update: FirmwareUpdateStatus,
    attempt: Option<AttemptSlot>,
    /// Snapshot last written to the DAO; unchanged records cost no writes
    last_persisted: Option<PersistedWatch>,
    was_connected: bool,
}

impl WatchRecord {
    fn new(identifier: PebbleIdentifier) -> Self {
        Self {
            identifier,
            name: None,
            nickname: None,
            scan_result: None,
            known_props: None,
            connect_goal: false,
            forget: false,
            last_failure: None,
            firmware_update_available: false,
            last_firmware_update: FirmwareUpdateStatus::Idle,
            attempt: None,
            last_persisted: None,
            was_connected: false,
        }
    }

    fn is_connected(&self) -> bool {
        self.attempt
            .as_ref()
            .map(|a| a.state.is_connected())
            .unwrap_or(false)
    }

    /// A record is kept only while something still refers to it
    fn is_garbage(&self) -> bool {
        self.scan_result.is_none()
            && self.known_props.is_none()
            && !self.connect_goal
            && self.attempt.is_none()
    }
}

/// Handle to the running engine
pub struct WatchManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    watches_rx: watch::Receiver<Vec<PebbleDevice>>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    task: JoinHandle<()>,
}

impl WatchManager {
    /// Load persisted watches and start the reconciliation loop
    pub async fn start(config: EngineConfig, deps: EngineDeps) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (watch_tx, watches_rx) = watch::channel(Vec::new());
        let (events_tx, _) = broadcast::channel(64);

        let mut records = BTreeMap::new();
        for persisted in deps.dao.load_all().await? {
            let mut record = WatchRecord::new(persisted.identifier.clone());
            record.name = Some(persisted.name.clone());
            record.nickname = persisted.nickname.clone();
            record.known_props = Some(persisted.props.clone());
            record.last_persisted = Some(persisted.clone());
            records.insert(persisted.identifier, record);
        }
        info!("Engine starting with {} known watches", records.len());

        let mut reconciler = Reconciler {
            config,
            deps,
            records,
            adapter_state: BluetoothState::Unavailable,
            signal_tx,
            watch_tx,
            events_tx: events_tx.clone(),
        };

        let task = tokio::spawn(async move {
            reconciler.run(cmd_rx, signal_rx).await;
        });

        Ok(Self {
            cmd_tx,
            watches_rx,
            events_tx,
            task,
        })
    }

    /// Read-only device list; updated after every reconciliation pass
    pub fn watches(&self) -> watch::Receiver<Vec<PebbleDevice>> {
        self.watches_rx.clone()
    }

    /// Subscribe to connect/disconnect/failure transitions
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Declare that this watch should be connected
    pub fn request_connection(&self, identifier: PebbleIdentifier) -> Result<()> {
        self.send(Command::RequestConnection(identifier))
    }

    /// Withdraw the connect goal for this watch
    pub fn request_disconnection(&self, identifier: PebbleIdentifier) -> Result<()> {
        self.send(Command::RequestDisconnection(identifier))
    }

    /// Feed one scan sighting into the model
    pub fn add_scan_result(&self, scan: ScanResult) -> Result<()> {
        self.send(Command::AddScanResult(scan))
    }

    /// Drop all scan sightings (e.g. when a scan session ends)
    pub fn clear_scan_results(&self) -> Result<()> {
        self.send(Command::ClearScanResults)
    }

    /// Remove the durable record for a watch and disconnect it
    pub fn forget(&self, identifier: PebbleIdentifier) -> Result<()> {
        self.send(Command::Forget(identifier))
    }

    pub fn set_nickname(
        &self,
        identifier: PebbleIdentifier,
        nickname: Option<String>,
    ) -> Result<()> {
        self.send(Command::SetNickname(identifier, nickname))
    }

    /// Human-readable dump of the manager's internal state
    pub async fn debug_state(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::DebugDump(tx))?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| EngineError::EngineStopped)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The single-writer loop owning all watch state
struct Reconciler {
    config: EngineConfig,
    deps: EngineDeps,
    records: BTreeMap<PebbleIdentifier, WatchRecord>,
    adapter_state: BluetoothState,
    signal_tx: mpsc::UnboundedSender<ConnectorSignal>,
    watch_tx: watch::Sender<Vec<PebbleDevice>>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

impl Reconciler {
    async fn run(
        &mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut signal_rx: mpsc::UnboundedReceiver<ConnectorSignal>,
    ) {
        let mut bt_rx = self.deps.bluetooth.subscribe();
        self.adapter_state = *bt_rx.borrow();
        self.reconcile().await;

        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => self.apply_command(command).await,
                        None => break,
                    }
                }
                signal = signal_rx.recv() => {
                    // The loop holds a sender, so the channel cannot close
                    if let Some(signal) = signal {
                        self.apply_signal(signal).await;
                    }
                }
                changed = bt_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.adapter_state = *bt_rx.borrow();
                    info!("Adapter state now {:?}", self.adapter_state);
                }
            }
            self.reconcile().await;
        }
        debug!("Reconciliation loop stopped");
    }

    async fn apply_command(&mut self, command: Command) {
        match command {
            Command::RequestConnection(identifier) => {
                // Goals stay declared per watch; exclusive mode is enforced
                // when attempts are started, not by withdrawing other goals.
                let record = self.record_mut(identifier.clone());
                record.connect_goal = true;
                info!("Connect goal set for {}", identifier);
            }
            Command::RequestDisconnection(identifier) => {
                if let Some(record) = self.records.get_mut(&identifier) {
                    record.connect_goal = false;
                    info!("Connect goal withdrawn for {}", identifier);
                }
            }
            Command::AddScanResult(scan) => {
                let record = self.record_mut(scan.identifier.clone());
                debug!("Scan sighting for {}: {:?} dBm", scan.identifier, scan.rssi);
                record.scan_result = Some(scan);
            }
            Command::ClearScanResults => {
                for record in self.records.values_mut() {
                    record.scan_result = None;
                }
                debug!("Cleared all scan sightings");
            }
            Command::Forget(identifier) => self.forget(&identifier).await,
            Command::SetNickname(identifier, nickname) => {
                if let Some(record) = self.records.get_mut(&identifier) {
                    record.nickname = nickname;
                } else {
                    warn!("Nickname for unknown watch {} ignored", identifier);
                }
            }
            Command::DebugDump(reply) => {
                let _ = reply.send(self.dump());
            }
        }
    }

    async fn apply_signal(&mut self, signal: ConnectorSignal) {
        let ConnectorSignal { identifier, kind } = signal;
        match kind {
            ConnectorSignalKind::StateChanged(state) => {
                if let ConnectingPebbleState::Failed(reason) = &state {
                    self.record_failure(&identifier, *reason).await;
                }
                if let Some(record) = self.records.get_mut(&identifier) {
                    if let Some(attempt) = record.attempt.as_mut() {
                        attempt.state = state;
                    }
                }
            }
            ConnectorSignalKind::ScopeReady { protocol } => {
                if let Some(attempt) = self.attempt_mut(&identifier) {
                    attempt.protocol = Some(protocol);
                }
            }
            ConnectorSignalKind::SubState(update) => {
                if let Some(attempt) = self.attempt_mut(&identifier) {
                    match update {
                        SubStateUpdate::Battery(v) => attempt.active.battery = v,
                        SubStateUpdate::FirmwareUpdateAvailable(v) => {
                            attempt.active.firmware_update_available = v
                        }
                        SubStateUpdate::FirmwareUpdate(v) => attempt.active.firmware_update = v,
                        SubStateUpdate::LanguagePack(v) => attempt.active.language_pack = v,
                    }
                }
            }
            ConnectorSignalKind::AttemptEnded => {
                if let Some(record) = self.records.get_mut(&identifier) {
                    debug!("Attempt slot for {} freed", identifier);
                    record.attempt = None;
                }
            }
        }
    }

    /// Fold a terminal failure into the per-watch bookkeeping
    async fn record_failure(&mut self, identifier: &PebbleIdentifier, reason: ConnectionFailureReason) {
        if reason == ConnectionFailureReason::UnresolvedIdentity {
            // The persisted identifier no longer maps to anything the
            // platform can dial; keeping the record would retry forever.
            warn!("{} could not be resolved, forgetting it", identifier);
            self.forget(identifier).await;
            return;
        }
        if let Some(record) = self.records.get_mut(identifier) {
            let failure = ConnectionFailureInfo::record(record.last_failure, reason);
            warn!(
                "Attempt for {} failed: {} (consecutive: {})",
                identifier, reason, failure.consecutive
            );
            record.last_failure = Some(failure);
            let _ = self.events_tx.send(ConnectionEvent::AttemptFailed {
                identifier: identifier.clone(),
                failure,
            });
        }
    }

    /// Mark a watch for deletion; the record drops once its attempt ends
    async fn forget(&mut self, identifier: &PebbleIdentifier) {
        if let Some(record) = self.records.get_mut(identifier) {
            record.connect_goal = false;
            record.forget = true;
            if let Some(attempt) = record.attempt.as_mut() {
                attempt.handle.disconnect();
                attempt.disconnect_requested = true;
            }
            info!("Forgetting watch {}", identifier);
        } else if let Err(e) = self.deps.dao.delete(identifier).await {
            warn!("Failed to delete persisted record for {}: {}", identifier, e);
        }
    }

    /// One reconciliation round; re-runs while edge handling keeps mutating
    async fn reconcile(&mut self) {
        for _ in 0..4 {
            if !self.pass().await {
                break;
            }
        }
    }

    /// A single pass over every record; returns whether more reconciliation
    /// is pending (an edge fired, or goal enforcement mutated forget state)
    async fn pass(&mut self) -> bool {
        self.persist_changed().await;
        self.drop_forgotten().await;
        self.collect_garbage();
        let goal_dirty = self.enforce_goals().await;
        self.refresh_caches();
        self.publish_projection();
        self.handle_edges() || goal_dirty
    }

    async fn persist_changed(&mut self) {
        for record in self.records.values_mut() {
            if record.forget {
                continue;
            }
            let Some(props) = &record.known_props else {
                continue;
            };
            let snapshot = PersistedWatch {
                identifier: record.identifier.clone(),
                name: record
                    .name
                    .clone()
                    .unwrap_or_else(|| record.identifier.to_string()),
                nickname: record.nickname.clone(),
                props: props.clone(),
            };
            if record.last_persisted.as_ref() == Some(&snapshot) {
                continue;
            }
            match self.deps.dao.upsert(&snapshot).await {
                Ok(()) => record.last_persisted = Some(snapshot),
                Err(e) => warn!("Failed to persist {}: {}", record.identifier, e),
            }
        }
    }

    /// Complete deferred deletions once their teardown has finished
    async fn drop_forgotten(&mut self) {
        let ready: Vec<PebbleIdentifier> = self
            .records
            .values()
            .filter(|r| r.forget && r.attempt.is_none())
            .map(|r| r.identifier.clone())
            .collect();
        for identifier in ready {
            if let Err(e) = self.deps.dao.delete(&identifier).await {
                warn!("Failed to delete persisted record for {}: {}", identifier, e);
            }
            self.records.remove(&identifier);
            info!("Forgot watch {}", identifier);
        }
    }

    fn collect_garbage(&mut self) {
        self.records.retain(|identifier, record| {
            if record.is_garbage() {
                debug!("Dropping empty record for {}", identifier);
                false
            } else {
                true
            }
        });
    }

    /// Start and stop attempts so reality converges on the declared goals
    ///
    /// Returns true when a record was marked forgotten, so the caller knows
    /// to run another pass and complete the deferred deletion.
    async fn enforce_goals(&mut self) -> bool {
        let adapter_enabled = self.adapter_state.is_enabled();
        let any_attempt = self.records.values().any(|r| r.attempt.is_some());

        let mut to_spawn = Vec::new();
        for record in self.records.values_mut() {
            let needs_adapter = !matches!(record.identifier, PebbleIdentifier::Socket(_));

            if let Some(attempt) = record.attempt.as_mut() {
                let should_drop =
                    !record.connect_goal || (needs_adapter && !adapter_enabled);
                if should_drop && !attempt.disconnect_requested {
                    info!("Disconnecting {}", record.identifier);
                    attempt.handle.disconnect();
                    attempt.disconnect_requested = true;
                }
                continue;
            }

            if !record.connect_goal {
                continue;
            }
            if needs_adapter && !adapter_enabled {
                debug!(
                    "Holding connect goal for {}: adapter {:?}",
                    record.identifier, self.adapter_state
                );
                continue;
            }
            // One watch at a time unless configured otherwise; the slot
            // frees up once the other attempt's teardown completes.
            if !self.config.multiple_watches && any_attempt {
                continue;
            }
            to_spawn.push(record.identifier.clone());
            if !self.config.multiple_watches {
                break;
            }
        }

        let mut dirty = false;
        for identifier in to_spawn {
            dirty |= self.spawn_attempt(identifier).await;
        }
        dirty
    }

    /// Returns true when the record was forgotten instead of spawned
    async fn spawn_attempt(&mut self, identifier: PebbleIdentifier) -> bool {
        let transport = match self.deps.transport_factory.create(&identifier) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Cannot resolve {} to a transport: {}", identifier, e);
                self.forget(&identifier).await;
                return true;
            }
        };

        info!("Starting connection attempt for {}", identifier);
        let negotiator = self.deps.negotiator.clone();
        let scope_factory = self.deps.scope_factory.clone();
        let signals = self.signal_tx.clone();
        let recovery_policy = RecoveryPolicy {
            ignore_missing_recovery: self.config.ignore_missing_recovery,
        };
        let negotiation_timeout = self.config.negotiation_timeout();
        let disconnect_timeout = self.config.disconnect_timeout();
        let settle_delay = self.config.settle_delay();

        let record = self.record_mut(identifier.clone());
        let handle = PebbleConnector::spawn(ConnectorParams {
            identifier: identifier.clone(),
            transport,
            negotiator,
            scope_factory,
            signals,
            recovery_policy,
            negotiation_timeout,
            disconnect_timeout,
            settle_delay,
            last_failure: record.last_failure.map(|f| f.reason),
        });
        record.attempt = Some(AttemptSlot {
            handle,
            state: ConnectingPebbleState::Inactive,
            protocol: None,
            active: ActivePebbleState::default(),
            disconnect_requested: false,
        });
        false
    }

    /// Mirror the live firmware-availability signal into the record
    fn refresh_caches(&mut self) {
        for record in self.records.values_mut() {
            if let Some(attempt) = record.attempt.as_ref() {
                record.firmware_update_available = attempt.active.firmware_update_available;
            }
        }
    }

    fn publish_projection(&self) {
        let devices: Vec<PebbleDevice> = self
            .records
            .values()
            .map(|record| {
                let attempt = record.attempt.as_ref();
                project(ProjectionInputs {
                    identifier: &record.identifier,
                    scan_result: record.scan_result.as_ref(),
                    name: record.name.as_deref(),
                    nickname: record.nickname.as_deref(),
                    known_props: record.known_props.as_ref(),
                    connect_goal: record.connect_goal,
                    attempt_state: attempt.map(|a| &a.state),
                    attempt_outstanding: attempt.is_some(),
                    last_failure: record.last_failure,
                    protocol: attempt.and_then(|a| a.protocol.as_ref()),
                    active: attempt.map(|a| a.active).unwrap_or_default(),
                })
            })
            .collect();
        self.watch_tx.send_replace(devices);
    }

    /// Detect connected/disconnected transitions and apply their effects
    fn handle_edges(&mut self) -> bool {
        let mut dirty = false;
        let mut scan_clear = false;
        let mut redials = Vec::new();

        for record in self.records.values_mut() {
            let connected = record.is_connected();

            if connected && !record.was_connected {
                let attempt = record.attempt.as_ref().unwrap();
                let info = attempt.state.watch_info().unwrap();
                let recovery = matches!(
                    attempt.state,
                    ConnectingPebbleState::ConnectedInRecovery(_)
                );
                info!("{} is now connected (recovery: {})", record.identifier, recovery);

                record.name = Some(info.name.clone());
                record.known_props = Some(info.to_known_props());
                record.last_failure = None;
                scan_clear = true;

                if self.config.prefer_classic && record.identifier.is_ble() {
                    if let Some(classic) = &info.classic_address {
                        redials.push((record.identifier.clone(), classic.clone()));
                    }
                }

                let _ = self.events_tx.send(ConnectionEvent::Connected {
                    identifier: record.identifier.clone(),
                    recovery,
                });
                record.was_connected = true;
                dirty = true;
            } else if !connected && record.was_connected {
                info!("{} is now disconnected", record.identifier);
                if let Some(attempt) = record.attempt.as_ref() {
                    record.last_firmware_update = attempt.active.firmware_update;
                }
                let _ = self.events_tx.send(ConnectionEvent::Disconnected {
                    identifier: record.identifier.clone(),
                });
                record.was_connected = false;
                dirty = true;
            }
        }

        // A successful connection invalidates the scan session fleet-wide
        if scan_clear {
            for record in self.records.values_mut() {
                record.scan_result = None;
            }
        }

        // Move the connect goal from the BLE identity to the Classic one;
        // the next pass tears down BLE and dials Classic.
        for (ble_id, classic_addr) in redials {
            let classic_id = PebbleIdentifier::Classic(classic_addr);
            info!("Redialing {} over {}", ble_id, classic_id);

            let (name, nickname, props) = {
                let ble = self.records.get_mut(&ble_id).unwrap();
                ble.connect_goal = false;
                (ble.name.clone(), ble.nickname.clone(), ble.known_props.clone())
            };
            let classic = self.record_mut(classic_id);
            classic.connect_goal = true;
            classic.name = classic.name.take().or(name);
            classic.nickname = classic.nickname.take().or(nickname);
            classic.known_props = classic.known_props.take().or(props);
        }

        dirty
    }

    /// Fetch or create the record for an identifier
    ///
    /// New records get a synthetic sighting so every tracked watch always
    /// carries either a scan result or known props.
    fn record_mut(&mut self, identifier: PebbleIdentifier) -> &mut WatchRecord {
        self.records.entry(identifier.clone()).or_insert_with(|| {
            let mut record = WatchRecord::new(identifier.clone());
            record.scan_result = Some(ScanResult::new(
                identifier.clone(),
                identifier.to_string(),
                None,
            ));
            record
        })
    }

    fn attempt_mut(&mut self, identifier: &PebbleIdentifier) -> Option<&mut AttemptSlot> {
        self.records.get_mut(identifier)?.attempt.as_mut()
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "adapter: {:?}", self.adapter_state);
        let _ = writeln!(out, "watches: {}", self.records.len());
        for record in self.records.values() {
            let state = record
                .attempt
                .as_ref()
                .map(|a| a.state.label())
                .unwrap_or("idle");
            let _ = writeln!(
                out,
                "  {} goal={} state={} known={} scan={} forget={} fw_avail={} failure={:?}",
                record.identifier,
                record.connect_goal,
                state,
                record.known_props.is_some(),
                record.scan_result.is_some(),
                record.forget,
                record.firmware_update_available,
                record.last_failure.map(|f| (f.reason.to_string(), f.consecutive)),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StaticBluetoothState;
    use crate::negotiation::WatchInfo;
    use crate::scope::{ConnectionScope, DefaultScopeFactory};
    use crate::transport::{ConnectOutcome, DisconnectReason, TransportConnector};
    use crate::watch::FirmwareVersion;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    struct LoopbackTransport {
        disconnected_tx: watch::Sender<Option<DisconnectReason>>,
    }

    #[async_trait]
    impl TransportConnector for LoopbackTransport {
        async fn connect(&self, _last: Option<ConnectionFailureReason>) -> ConnectOutcome {
            ConnectOutcome::Success
        }

        async fn disconnect(&self) {
            self.disconnected_tx.send_modify(|v| {
                if v.is_none() {
                    *v = Some(DisconnectReason::Requested);
                }
            });
        }

        async fn disconnected(&self) -> DisconnectReason {
            let mut rx = self.disconnected_tx.subscribe();
            loop {
                if let Some(reason) = *rx.borrow() {
                    return reason;
                }
                if rx.changed().await.is_err() {
                    return DisconnectReason::TransportError;
                }
            }
        }
    }

    struct LoopbackFactory;

    impl TransportFactory for LoopbackFactory {
        fn create(&self, _identifier: &PebbleIdentifier) -> Result<Arc<dyn TransportConnector>> {
            let (disconnected_tx, _) = watch::channel(None);
            Ok(Arc::new(LoopbackTransport { disconnected_tx }))
        }
    }

    struct FixedNegotiator;

    #[async_trait]
    impl Negotiator for FixedNegotiator {
        async fn negotiate(&self, _scope: &ConnectionScope) -> Option<WatchInfo> {
            Some(WatchInfo {
                name: "Pebble Time".to_string(),
                running_firmware: FirmwareVersion::new(4, 3, 1),
                recovery_firmware: Some(FirmwareVersion::recovery(3, 8, 2)),
                serial: "Q302445E0123".to_string(),
                hardware_platform: "snowy_dvt".to_string(),
                color: None,
                capabilities: vec![],
                classic_address: None,
            })
        }
    }

    struct NullDao;

    #[async_trait]
    impl KnownWatchDao for NullDao {
        async fn load_all(&self) -> Result<Vec<PersistedWatch>> {
            Ok(Vec::new())
        }
        async fn upsert(&self, _watch: &PersistedWatch) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _identifier: &PebbleIdentifier) -> Result<()> {
            Ok(())
        }
    }

    fn deps() -> EngineDeps {
        EngineDeps {
            transport_factory: Arc::new(LoopbackFactory),
            negotiator: Arc::new(FixedNegotiator),
            scope_factory: Arc::new(DefaultScopeFactory),
            dao: Arc::new(NullDao),
            bluetooth: Arc::new(StaticBluetoothState::new(BluetoothState::Enabled)),
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.settle_delay_ms = 0;
        config
    }

    async fn wait_for(
        rx: &mut watch::Receiver<Vec<PebbleDevice>>,
        predicate: impl Fn(&[PebbleDevice]) -> bool,
    ) {
        timeout(Duration::from_secs(5), async {
            loop {
                if predicate(&rx.borrow()) {
                    return;
                }
                rx.changed().await.expect("engine stopped");
            }
        })
        .await
        .expect("projection never satisfied predicate");
    }

    #[tokio::test]
    async fn test_goal_convergence_to_connected() {
        let manager = WatchManager::start(fast_config(), deps()).await.unwrap();
        let mut watches = manager.watches();

        let id = PebbleIdentifier::Socket("emulator".to_string());
        manager.request_connection(id.clone()).unwrap();

        wait_for(&mut watches, |devices| {
            devices
                .iter()
                .any(|d| d.identifier() == &id && matches!(d, PebbleDevice::Connected { .. }))
        })
        .await;
    }

    #[tokio::test]
    async fn test_disconnection_returns_to_known() {
        let manager = WatchManager::start(fast_config(), deps()).await.unwrap();
        let mut watches = manager.watches();

        let id = PebbleIdentifier::Socket("emulator".to_string());
        manager.request_connection(id.clone()).unwrap();
        wait_for(&mut watches, |devices| {
            devices.iter().any(|d| d.is_connected())
        })
        .await;

        manager.request_disconnection(id.clone()).unwrap();
        wait_for(&mut watches, |devices| {
            devices
                .iter()
                .any(|d| d.identifier() == &id && matches!(d, PebbleDevice::Known { .. }))
        })
        .await;
    }

    #[tokio::test]
    async fn test_scan_results_cleared_on_connect() {
        let manager = WatchManager::start(fast_config(), deps()).await.unwrap();
        let mut watches = manager.watches();

        let other = PebbleIdentifier::Ble("00:11:22:33:44:55".to_string());
        manager
            .add_scan_result(ScanResult::new(other.clone(), "Pebble 1F2A", Some(-70)))
            .unwrap();
        wait_for(&mut watches, |devices| devices.len() == 1).await;

        let id = PebbleIdentifier::Socket("emulator".to_string());
        manager.request_connection(id.clone()).unwrap();
        wait_for(&mut watches, |devices| {
            devices.iter().any(|d| d.is_connected())
        })
        .await;

        // The sighting-only record is gone once the scan session is cleared
        wait_for(&mut watches, |devices| {
            !devices.iter().any(|d| d.identifier() == &other)
        })
        .await;
    }
}
