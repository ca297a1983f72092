//! Known-watch persistence
//!
//! The engine persists one record per known watch so that paired watches
//! survive application restarts. The DAO is a narrow seam; the default
//! implementation is a JSON file registry.

use crate::error::Result;
use crate::identity::PebbleIdentifier;
use crate::watch::PersistedWatch;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// CRUD seam for the durable watch record
#[async_trait]
pub trait KnownWatchDao: Send + Sync {
    /// Load every persisted record
    async fn load_all(&self) -> Result<Vec<PersistedWatch>>;

    /// Insert or replace the record for `watch.identifier`
    async fn upsert(&self, watch: &PersistedWatch) -> Result<()>;

    /// Delete the record for an identifier, if present
    async fn delete(&self, identifier: &PebbleIdentifier) -> Result<()>;
}

/// JSON-file-backed watch registry
///
/// Records are keyed by the identifier's string form. The whole registry is
/// rewritten on each change; the record set is small (a handful of watches).
pub struct JsonWatchRegistry {
    registry_path: PathBuf,
    records: tokio::sync::Mutex<HashMap<String, PersistedWatch>>,
}

impl JsonWatchRegistry {
    /// Open (or create) a registry at the given path
    pub fn new(registry_path: impl Into<PathBuf>) -> Result<Self> {
        let registry_path = registry_path.into();

        if let Some(parent) = registry_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records = if registry_path.exists() {
            let json = fs::read_to_string(&registry_path)?;
            let records: HashMap<String, PersistedWatch> = serde_json::from_str(&json)?;
            info!("Loaded {} watches from registry", records.len());
            records
        } else {
            debug!("No existing registry file at {:?}", registry_path);
            HashMap::new()
        };

        Ok(Self {
            registry_path,
            records: tokio::sync::Mutex::new(records),
        })
    }

    /// Default registry location under the platform data directory
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pebbled")
            .join("watches.json")
    }

    fn write_records(&self, records: &HashMap<String, PersistedWatch>) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        fs::write(&self.registry_path, json)?;
        debug!("Saved watch registry to {:?}", self.registry_path);
        Ok(())
    }
}

#[async_trait]
impl KnownWatchDao for JsonWatchRegistry {
    async fn load_all(&self) -> Result<Vec<PersistedWatch>> {
        let records = self.records.lock().await;
        Ok(records.values().cloned().collect())
    }

    async fn upsert(&self, watch: &PersistedWatch) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert(watch.identifier.to_string(), watch.clone());
        self.write_records(&records)
    }

    async fn delete(&self, identifier: &PebbleIdentifier) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.remove(&identifier.to_string()).is_some() {
            info!("Removed persisted record for {}", identifier);
            self.write_records(&records)?;
        }
        Ok(())
    }
}
