//! Socket transport
//!
//! TCP transport used for the emulator and for tests. The connector owns
//! the stream for link supervision only; payload traffic is not this
//! layer's concern.

use super::{ConnectOutcome, ConnectionFailureReason, DisconnectReason, TransportConnector};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Default timeout for the TCP connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP-backed transport connector
pub struct SocketTransport {
    addr: String,
    connect_timeout: Duration,
    disconnected_tx: watch::Sender<Option<DisconnectReason>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    pub fn new(addr: String) -> Self {
        let (disconnected_tx, _) = watch::channel(None);
        Self {
            addr,
            connect_timeout: CONNECT_TIMEOUT,
            disconnected_tx,
            monitor: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Publish a disconnect reason unless one is already set
fn publish_once(tx: &watch::Sender<Option<DisconnectReason>>, reason: DisconnectReason) {
    tx.send_modify(|current| {
        if current.is_none() {
            *current = Some(reason);
        }
    });
}

#[async_trait]
impl TransportConnector for SocketTransport {
    async fn connect(&self, _last_failure: Option<ConnectionFailureReason>) -> ConnectOutcome {
        debug!("Connecting to socket transport at {}", self.addr);
        self.disconnected_tx.send_replace(None);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Socket connect to {} failed: {}", self.addr, e);
                return ConnectOutcome::Failed(ConnectionFailureReason::RadioError);
            }
            Err(_) => {
                warn!("Socket connect to {} timed out", self.addr);
                return ConnectOutcome::Failed(ConnectionFailureReason::ConnectTimeout);
            }
        };

        info!("Socket transport connected to {}", self.addr);

        let disconnected_tx = self.disconnected_tx.clone();
        let addr = self.addr.clone();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => {
                        debug!("Socket transport {} closed by remote", addr);
                        publish_once(&disconnected_tx, DisconnectReason::RemoteClosed);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Socket transport {} read error: {}", addr, e);
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
            // Dropping the monitor drops the stream and closes the socket
            handle.abort();
            info!("Socket transport to {} disconnected", self.addr);
        }
        publish_once(&self.disconnected_tx, DisconnectReason::Requested);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let transport = SocketTransport::new(addr);
        let outcome = transport.connect(None).await;
        assert_eq!(outcome, ConnectOutcome::Success);

        // Accept then drop the peer side
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        let reason = transport.disconnected().await;
        assert_eq!(reason, DisconnectReason::RemoteClosed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port that refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = SocketTransport::new(addr);
        let outcome = transport.connect(None).await;
        assert_eq!(
            outcome,
            ConnectOutcome::Failed(ConnectionFailureReason::RadioError)
        );
    }

    #[tokio::test]
    async fn test_requested_disconnect_signals_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let transport = std::sync::Arc::new(SocketTransport::new(addr));
        assert_eq!(transport.connect(None).await, ConnectOutcome::Success);
        let (_peer, _) = listener.accept().await.unwrap();

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.disconnected().await })
        };

        transport.disconnect().await;
        let reason = waiter.await.unwrap();
        assert_eq!(reason, DisconnectReason::Requested);
    }
}
