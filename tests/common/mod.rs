//! Fixtures shared by the integration tests

#![allow(dead_code)]

use k8s_openapi::api::core::v1::{
    ISCSIPersistentVolumeSource, NFSVolumeSource, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource,
    PersistentVolumeSpec, PersistentVolumeStatus, Pod, PodSpec, PodStatus, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use pv_upgrade_operator::{
    MemoryGateway, MemoryVolumeRegistry, PvUpgrader, SimulatedControllers, UpgradeConfig,
    VolumeProtocol, VolumeRecord, VolumeState,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const LEGACY_PROVISIONER: &str = "netapp.io/trident";
pub const CSI_DRIVER: &str = "csi.trident.netapp.io";

pub fn record(name: &str) -> VolumeRecord {
    VolumeRecord {
        name: name.into(),
        display_name: Some("data".into()),
        internal_name: format!("trident_{}", name),
        state: VolumeState::Online,
        backend_uuid: "6f3a1c52-backend".into(),
        protocol: VolumeProtocol::File,
    }
}

fn legacy_volume(name: &str, spec: PersistentVolumeSpec) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            annotations: Some(BTreeMap::from([
                (
                    "pv.kubernetes.io/provisioned-by".to_string(),
                    LEGACY_PROVISIONER.to_string(),
                ),
                ("pv.kubernetes.io/bound-by-controller".to_string(), "yes".to_string()),
            ])),
            finalizers: Some(Vec::new()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                kind: Some("PersistentVolumeClaim".into()),
                name: Some("pvc1".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            }),
            storage_class_name: Some("gold".into()),
            persistent_volume_reclaim_policy: Some("Retain".into()),
            ..spec
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        }),
    }
}

pub fn nfs_volume(name: &str, read_only: bool) -> PersistentVolume {
    legacy_volume(
        name,
        PersistentVolumeSpec {
            nfs: Some(NFSVolumeSource {
                server: "10.0.0.1".into(),
                path: format!("/trident_{}", name),
                read_only: Some(read_only),
            }),
            ..Default::default()
        },
    )
}

pub fn iscsi_volume(name: &str) -> PersistentVolume {
    legacy_volume(
        name,
        PersistentVolumeSpec {
            iscsi: Some(ISCSIPersistentVolumeSource {
                target_portal: "10.0.0.2:3260".into(),
                iqn: "iqn.1992-08.com.netapp:sn.1".into(),
                lun: 0,
                fs_type: Some("xfs".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

pub fn bound_claim() -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("pvc1".into()),
            namespace: Some("ns".into()),
            annotations: Some(BTreeMap::from([(
                "pv.kubernetes.io/bind-completed".to_string(),
                "yes".to_string(),
            )])),
            ..Default::default()
        },
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_using(name: &str, claim: &str, owned: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            owner_references: owned.then(|| {
                vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: "ReplicaSet".into(),
                    name: "app-7d4b9".into(),
                    uid: "rs-uid".into(),
                    controller: Some(true),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: "data".into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.into(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        }),
    }
}

pub struct Cluster {
    pub gateway: Arc<MemoryGateway>,
    pub upgrader: Arc<PvUpgrader>,
}

pub fn cluster_with(controllers: SimulatedControllers, records: Vec<VolumeRecord>) -> Cluster {
    let gateway = Arc::new(MemoryGateway::with_controllers(controllers));
    let registry = Arc::new(MemoryVolumeRegistry::from_records(records));
    let upgrader = PvUpgrader::new(UpgradeConfig::default(), registry, gateway.clone())
        .expect("default config is valid");
    Cluster { gateway, upgrader }
}

pub fn cluster(records: Vec<VolumeRecord>) -> Cluster {
    cluster_with(SimulatedControllers::default(), records)
}
