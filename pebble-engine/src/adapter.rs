//! Bluetooth adapter state
//!
//! The reconciliation loop only starts connection attempts while the
//! adapter is enabled, and tears attempts down when it goes away. The
//! provider is a narrow seam so tests can drive adapter transitions.

use crate::config::EngineConfig;
use bluer::Session;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Power state of the local Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothState {
    /// Adapter present and powered
    Enabled,

    /// Adapter present but powered off
    Disabled,

    /// No adapter / stack unavailable
    Unavailable,
}

impl BluetoothState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, BluetoothState::Enabled)
    }
}

/// Source of adapter state changes
pub trait BluetoothStateProvider: Send + Sync {
    /// Subscribe to the current state and all future changes
    fn subscribe(&self) -> watch::Receiver<BluetoothState>;
}

/// Fixed adapter state, settable from outside (tests, socket-only setups)
pub struct StaticBluetoothState {
    tx: watch::Sender<BluetoothState>,
}

impl StaticBluetoothState {
    pub fn new(state: BluetoothState) -> Self {
        let (tx, _) = watch::channel(state);
        Self { tx }
    }

    pub fn set(&self, state: BluetoothState) {
        let _ = self.tx.send(state);
    }
}

impl BluetoothStateProvider for StaticBluetoothState {
    fn subscribe(&self) -> watch::Receiver<BluetoothState> {
        self.tx.subscribe()
    }
}

/// BlueZ-backed provider polling the default adapter's powered property
pub struct BluerAdapterWatcher {
    tx: watch::Sender<BluetoothState>,
    _poller: tokio::task::JoinHandle<()>,
}

impl BluerAdapterWatcher {
    /// Start watching; the poll interval comes from the engine config
    pub fn start(config: &EngineConfig) -> Self {
        let (tx, _) = watch::channel(BluetoothState::Unavailable);
        let poll_interval = config.adapter_poll_interval();
        let poll_tx = tx.clone();

        let poller = tokio::spawn(async move {
            loop {
                let state = match Self::read_state().await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!("Adapter state read failed: {}", e);
                        BluetoothState::Unavailable
                    }
                };
                poll_tx.send_if_modified(|current| {
                    if *current != state {
                        info!("Bluetooth adapter state: {:?} -> {:?}", current, state);
                        *current = state;
                        true
                    } else {
                        false
                    }
                });
                sleep(poll_interval).await;
            }
        });

        Self { tx, _poller: poller }
    }

    async fn read_state() -> bluer::Result<BluetoothState> {
        let session = Session::new().await?;
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                debug!("No default adapter: {}", e);
                return Ok(BluetoothState::Unavailable);
            }
        };
        if adapter.is_powered().await? {
            Ok(BluetoothState::Enabled)
        } else {
            Ok(BluetoothState::Disabled)
        }
    }
}

impl BluetoothStateProvider for BluerAdapterWatcher {
    fn subscribe(&self) -> watch::Receiver<BluetoothState> {
        self.tx.subscribe()
    }
}

impl Drop for BluerAdapterWatcher {
    fn drop(&mut self) {
        self._poller.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_transitions() {
        let provider = StaticBluetoothState::new(BluetoothState::Disabled);
        let mut rx = provider.subscribe();
        assert_eq!(*rx.borrow(), BluetoothState::Disabled);

        provider.set(BluetoothState::Enabled);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_enabled());
    }
}
