//! Descriptor Converter
//!
//! Pure conversion of a legacy NFS or iSCSI PV into its CSI replacement.
//! The CSI volume attributes come from the registry record, never from the
//! legacy source.

use super::config::{
    ANN_DYNAMICALLY_PROVISIONED, ATTR_BACKEND_UUID, ATTR_INTERNAL_NAME, ATTR_NAME, ATTR_PROTOCOL,
};
use crate::domain::ports::VolumeRecord;
use crate::error::PreconditionError;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ISCSIPersistentVolumeSource, NFSVolumeSource, PersistentVolume,
};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// The legacy source carried by a PV
#[derive(Debug, Clone, Copy)]
pub enum LegacySource<'a> {
    Nfs(&'a NFSVolumeSource),
    Iscsi(&'a ISCSIPersistentVolumeSource),
}

impl LegacySource<'_> {
    /// Short protocol label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            LegacySource::Nfs(_) => "NFS",
            LegacySource::Iscsi(_) => "iSCSI",
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            LegacySource::Nfs(nfs) => nfs.read_only.unwrap_or(false),
            LegacySource::Iscsi(iscsi) => iscsi.read_only.unwrap_or(false),
        }
    }

    /// Filesystem type; NFS has none
    pub fn fs_type(&self) -> &str {
        match self {
            LegacySource::Nfs(_) => "",
            LegacySource::Iscsi(iscsi) => iscsi.fs_type.as_deref().unwrap_or_default(),
        }
    }
}

/// Find the single legacy source on a PV
pub fn legacy_source(pv: &PersistentVolume) -> Result<LegacySource<'_>, PreconditionError> {
    let spec = pv.spec.as_ref();
    let nfs = spec.and_then(|s| s.nfs.as_ref());
    let iscsi = spec.and_then(|s| s.iscsi.as_ref());

    match (nfs, iscsi) {
        (Some(nfs), None) => Ok(LegacySource::Nfs(nfs)),
        (None, Some(iscsi)) => Ok(LegacySource::Iscsi(iscsi)),
        (Some(_), Some(_)) => Err(PreconditionError::AmbiguousLegacySource { name: pv.name_any() }),
        (None, None) => Err(PreconditionError::NoLegacySource { name: pv.name_any() }),
    }
}

/// CSI volume attributes for a registry record
pub fn volume_attributes(record: &VolumeRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ATTR_BACKEND_UUID.to_string(), record.backend_uuid.clone()),
        (ATTR_NAME.to_string(), record.name.clone()),
        (ATTR_INTERNAL_NAME.to_string(), record.internal_name.clone()),
        (ATTR_PROTOCOL.to_string(), record.protocol.to_string()),
    ])
}

/// Build the CSI PV that replaces `pv`.
///
/// The result keeps the PV's name, labels, claim reference and the rest of
/// its spec. Server-assigned identity and status are cleared so the object
/// can be created, and the provisioner annotation names `csi_driver`.
pub fn build_csi_volume(
    pv: &PersistentVolume,
    record: &VolumeRecord,
    csi_driver: &str,
) -> Result<PersistentVolume, PreconditionError> {
    let source = legacy_source(pv)?;

    let fs_type = source.fs_type();
    let csi = CSIPersistentVolumeSource {
        driver: csi_driver.to_string(),
        volume_handle: pv.name_any(),
        read_only: Some(source.read_only()),
        fs_type: (!fs_type.is_empty()).then(|| fs_type.to_string()),
        volume_attributes: Some(volume_attributes(record)),
        ..Default::default()
    };

    let mut csi_pv = pv.clone();

    let meta = &mut csi_pv.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;

    csi_pv
        .annotations_mut()
        .insert(ANN_DYNAMICALLY_PROVISIONED.to_string(), csi_driver.to_string());

    let spec = csi_pv.spec.get_or_insert_with(Default::default);
    spec.nfs = None;
    spec.iscsi = None;
    spec.csi = Some(csi);

    csi_pv.status = None;

    Ok(csi_pv)
}
