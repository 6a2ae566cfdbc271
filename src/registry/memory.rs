//! In-memory Volume Registry
//!
//! Holds volume records in a map. Used by tests and by the CLI when the
//! records are supplied as a YAML file instead of a live registry.

use super::KIND_VOLUME;
use crate::domain::ports::{VolumeRecord, VolumeRegistry};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Registry backed by a map of volume records
#[derive(Debug, Default)]
pub struct MemoryVolumeRegistry {
    volumes: RwLock<BTreeMap<String, VolumeRecord>>,
}

impl MemoryVolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of records
    pub fn from_records(records: impl IntoIterator<Item = VolumeRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            registry.insert(record);
        }
        registry
    }

    /// Load records from a YAML file holding a sequence of volumes
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let records: Vec<VolumeRecord> = serde_yaml::from_str(&contents)?;

        if records.is_empty() {
            return Err(Error::Configuration(format!(
                "no volume records found in {}",
                path.display()
            )));
        }

        info!("Loaded {} volume records from {}", records.len(), path.display());
        Ok(Self::from_records(records))
    }

    /// Add or replace a record
    pub fn insert(&self, record: VolumeRecord) {
        self.volumes.write().insert(record.name.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.read().is_empty()
    }
}

#[async_trait]
impl VolumeRegistry for MemoryVolumeRegistry {
    async fn get_volume(&self, name: &str) -> Result<VolumeRecord> {
        self.volumes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(KIND_VOLUME, name))
    }
}
