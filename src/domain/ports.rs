//! Domain Ports - Core trait definitions for the upgrade operator
//!
//! These traits define the boundaries between the upgrade workflow and external systems.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::{PreconditionError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Volume Record Types
// =============================================================================

/// Lifecycle state of a volume as tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Online,
    Deleting,
    Upgrading,
    MissingBackend,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Online => write!(f, "online"),
            VolumeState::Deleting => write!(f, "deleting"),
            VolumeState::Upgrading => write!(f, "upgrading"),
            VolumeState::MissingBackend => write!(f, "missing_backend"),
            VolumeState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Access protocol of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeProtocol {
    File,
    Block,
    #[default]
    #[serde(rename = "")]
    Any,
}

impl std::fmt::Display for VolumeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeProtocol::File => write!(f, "file"),
            VolumeProtocol::Block => write!(f, "block"),
            VolumeProtocol::Any => Ok(()),
        }
    }
}

/// Authoritative metadata for a storage volume, owned by the registry.
///
/// The upgrade workflow only reads this record; it is returned unchanged
/// to the caller on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    /// Volume identifier, equal to the PV name
    pub name: String,
    /// Human-facing name, if the registry tracks one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Name of the volume on the storage backend
    pub internal_name: String,
    /// Lifecycle state
    pub state: VolumeState,
    /// Backend the volume is placed on
    #[serde(rename = "backendUUID")]
    pub backend_uuid: String,
    /// Access protocol
    #[serde(default)]
    pub protocol: VolumeProtocol,
}

// =============================================================================
// Upgrade Request
// =============================================================================

/// Kind of migration to perform on a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    /// Convert an NFS/iSCSI PV into a CSI PV
    Csi,
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationType::Csi => write!(f, "csi"),
        }
    }
}

impl std::str::FromStr for MigrationType {
    type Err = PreconditionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csi" => Ok(MigrationType::Csi),
            _ => Err(PreconditionError::UnsupportedMigrationType(s.to_string())),
        }
    }
}

/// Request to upgrade a single volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeVolumeRequest {
    /// Volume identifier (also the PV name)
    pub volume: String,
    /// Requested migration
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
}

impl UpgradeVolumeRequest {
    pub fn csi(volume: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            migration_type: MigrationType::Csi,
        }
    }
}

// =============================================================================
// Volume Registry Port
// =============================================================================

/// Port for the authoritative volume registry
#[async_trait]
pub trait VolumeRegistry: Send + Sync {
    /// Look up a volume; fails with a not-found error if unknown
    async fn get_volume(&self, name: &str) -> Result<VolumeRecord>;
}

// =============================================================================
// Cluster Gateway Port
// =============================================================================

/// Port for typed reads and writes against the cluster.
///
/// `cached_*` reads come from a watch-fed local store and may lag the API
/// server; they fail with [`crate::error::Error::ResourceNotFound`] when the
/// object is absent. Pod reads always go to the API server. Writes are
/// single-shot: retrying is the caller's concern.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Cached lookup of a PV by name
    async fn cached_volume(&self, name: &str) -> Result<PersistentVolume>;

    /// Cached lookup of a PVC by name and namespace
    async fn cached_claim(&self, name: &str, namespace: &str) -> Result<PersistentVolumeClaim>;

    /// Live list of the pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// Live lookup of a pod
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod>;

    /// Request deletion of a PV; succeeds if it is already gone
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Conditionally update a PV from `original` to `updated`
    async fn patch_volume(
        &self,
        original: &PersistentVolume,
        updated: &PersistentVolume,
    ) -> Result<PersistentVolume>;

    /// Conditionally update a PVC from `original` to `updated`
    async fn patch_claim(
        &self,
        original: &PersistentVolumeClaim,
        updated: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Create a PV
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;

    /// Request deletion of a pod; succeeds if it is already gone
    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeRegistryRef = Arc<dyn VolumeRegistry>;
pub type ClusterGatewayRef = Arc<dyn ClusterGateway>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_state_display() {
        assert_eq!(format!("{}", VolumeState::Online), "online");
        assert_eq!(format!("{}", VolumeState::MissingBackend), "missing_backend");
    }

    #[test]
    fn test_migration_type_parse() {
        assert_eq!("csi".parse::<MigrationType>().unwrap(), MigrationType::Csi);
        assert_eq!(" CSI ".parse::<MigrationType>().unwrap(), MigrationType::Csi);
        assert_eq!(
            "nfs".parse::<MigrationType>().unwrap_err(),
            PreconditionError::UnsupportedMigrationType("nfs".into())
        );
    }

    #[test]
    fn test_volume_record_json() {
        let json = r#"{
            "name": "vol1",
            "internalName": "trident_vol1",
            "state": "online",
            "backendUUID": "b-123",
            "protocol": "file"
        }"#;
        let record: VolumeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.state, VolumeState::Online);
        assert_eq!(record.protocol, VolumeProtocol::File);
        assert_eq!(record.display_name, None);

        let weird: VolumeState = serde_json::from_str("\"missing_volume\"").unwrap();
        assert_eq!(weird, VolumeState::Unknown);
    }
}
