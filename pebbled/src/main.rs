//! Pebble companion daemon
//!
//! Thin wiring around `pebble-engine`: loads the TOML configuration, builds
//! the engine with the production collaborators (BlueZ transports, JSON watch
//! registry, polled adapter watcher) and logs engine events until terminated.

use anyhow::{Context, Result};
use clap::Parser;
use pebble_engine::{
    BluerAdapterWatcher, ConnectionEvent, DefaultScopeFactory, EngineConfig, EngineDeps,
    JsonWatchRegistry, Negotiator, PebbleIdentifier, ScanResult, StandardTransportFactory,
    WatchManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pebbled")]
#[command(about = "Pebble watch connection daemon")]
struct Args {
    /// Configuration file path (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed an emulator watch at this host:port and connect to it
    #[arg(long)]
    emulator: Option<String>,

    /// Connect to a watch by identifier, e.g. `ble:00:11:22:33:44:55`
    #[arg(long)]
    connect: Option<String>,
}

/// Parse a `transport:address` identifier from the command line
fn parse_identifier(s: &str) -> Result<PebbleIdentifier> {
    let (transport, address) = s
        .split_once(':')
        .with_context(|| format!("expected transport:address, got '{}'", s))?;
    match transport {
        "ble" => Ok(PebbleIdentifier::Ble(address.to_string())),
        "classic" => Ok(PebbleIdentifier::Classic(address.to_string())),
        "socket" => Ok(PebbleIdentifier::Socket(address.to_string())),
        other => anyhow::bail!("unknown transport '{}'", other),
    }
}

/// Placeholder negotiator until the wire-protocol runner lands
///
/// TODO: replace with the pebble-protocol handshake once that crate exists;
/// until then every connection fails negotiation, which still exercises the
/// full attempt lifecycle.
struct UnimplementedNegotiator;

#[async_trait::async_trait]
impl Negotiator for UnimplementedNegotiator {
    async fn negotiate(
        &self,
        scope: &pebble_engine::ConnectionScope,
    ) -> Option<pebble_engine::WatchInfo> {
        warn!("No negotiator wired for {}", scope.identifier());
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(EngineConfig::default_path);
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    info!("Loaded configuration from {:?}", config_path);

    let registry = JsonWatchRegistry::new(JsonWatchRegistry::default_path())
        .context("failed to open watch registry")?;
    let adapter = BluerAdapterWatcher::start(&config);

    let manager = WatchManager::start(
        config,
        EngineDeps {
            transport_factory: Arc::new(StandardTransportFactory),
            negotiator: Arc::new(UnimplementedNegotiator),
            scope_factory: Arc::new(DefaultScopeFactory),
            dao: Arc::new(registry),
            bluetooth: Arc::new(adapter),
        },
    )
    .await
    .context("failed to start watch manager")?;

    if let Some(addr) = args.emulator {
        let identifier = PebbleIdentifier::Socket(addr.clone());
        manager.add_scan_result(ScanResult::new(
            identifier.clone(),
            format!("Emulator ({})", addr),
            None,
        ))?;
        manager.request_connection(identifier)?;
    }
    if let Some(target) = args.connect {
        manager.request_connection(parse_identifier(&target)?)?;
    }

    let mut events = manager.connection_events();
    let mut watches = manager.watches();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(ConnectionEvent::Connected { identifier, recovery }) => {
                        info!("Connected to {} (recovery: {})", identifier, recovery);
                    }
                    Ok(ConnectionEvent::Disconnected { identifier }) => {
                        info!("Disconnected from {}", identifier);
                    }
                    Ok(ConnectionEvent::AttemptFailed { identifier, failure }) => {
                        warn!(
                            "Attempt for {} failed: {} ({} in a row)",
                            identifier, failure.reason, failure.consecutive
                        );
                    }
                    Err(e) => {
                        error!("Event stream lost: {}", e);
                        break;
                    }
                }
            }
            changed = watches.changed() => {
                if changed.is_err() {
                    break;
                }
                let summary: Vec<String> = watches
                    .borrow()
                    .iter()
                    .map(|d| format!("{}={}", d.identifier(), d.label()))
                    .collect();
                info!("Watches: [{}]", summary.join(", "));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    manager.shutdown();
    Ok(())
}
