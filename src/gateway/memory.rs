//! In-memory Cluster Gateway
//!
//! An in-process stand-in for a cluster. It keeps PVs, PVCs and pods in
//! maps and imitates the controllers the upgrade workflow depends on:
//! garbage collection of deleted PVs once their finalizers are gone, the PV
//! controller moving a claim to Lost when its volume disappears and binding
//! it again when a matching volume shows up, and workload controllers
//! recreating deleted pods. Every write is recorded so callers can assert
//! exactly which mutations happened.

use super::{display_name, patch, verify_cached, KIND_POD, KIND_PV, KIND_PVC};
use crate::domain::ports::ClusterGateway;
use crate::error::{Error, Result};
use crate::upgrade::config::ANN_BIND_COMPLETED;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimStatus, PersistentVolumeStatus,
    Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Which controller reactions the in-memory cluster simulates
#[derive(Debug, Clone, Copy)]
pub struct SimulatedControllers {
    /// Move a PVC to Lost once the PV it is bound to disappears
    pub release_claims: bool,
    /// Bind an unbound PVC when a PV referencing it is created
    pub bind_claims: bool,
    /// Recreate deleted owned pods in the Pending phase
    pub recreate_owned_pods: bool,
}

impl Default for SimulatedControllers {
    fn default() -> Self {
        Self {
            release_claims: true,
            bind_claims: true,
            recreate_owned_pods: false,
        }
    }
}

/// A write issued through the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    DeleteVolume(String),
    PatchVolume(String),
    CreateVolume(String),
    PatchClaim(String),
    DeletePod(String),
}

// =============================================================================
// Cluster State
// =============================================================================

#[derive(Debug, Default)]
struct ClusterState {
    volumes: BTreeMap<String, PersistentVolume>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    pods: BTreeMap<String, Pod>,
    denied_pod_deletes: BTreeSet<String>,
    failing_pod_reads: BTreeMap<String, u32>,
    mutations: Vec<Mutation>,
    revision: u64,
}

impl ClusterState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn stamp<K: kube::Resource>(&mut self, object: &mut K) {
        let rv = self.next_revision();
        let meta = object.meta_mut();
        meta.resource_version = Some(rv);
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{:08}", self.revision));
        }
    }

    fn set_claim_phase(&mut self, key: &str, phase: &str) {
        let rv = self.next_revision();
        if let Some(claim) = self.claims.get_mut(key) {
            claim
                .status
                .get_or_insert_with(PersistentVolumeClaimStatus::default)
                .phase = Some(phase.to_string());
            claim.metadata.resource_version = Some(rv);
        }
    }
}

// =============================================================================
// Memory Gateway
// =============================================================================

/// In-memory implementation of the cluster gateway
#[derive(Debug, Default)]
pub struct MemoryGateway {
    controllers: SimulatedControllers,
    state: RwLock<ClusterState>,
}

impl MemoryGateway {
    /// Create an empty cluster with default controller behavior
    pub fn new() -> Self {
        Self::with_controllers(SimulatedControllers::default())
    }

    /// Create an empty cluster with the given controller behavior
    pub fn with_controllers(controllers: SimulatedControllers) -> Self {
        Self {
            controllers,
            state: RwLock::new(ClusterState::default()),
        }
    }

    /// Seed a PV, keyed by its name
    pub fn insert_volume(&self, mut volume: PersistentVolume) {
        let mut state = self.state.write();
        state.stamp(&mut volume);
        state.volumes.insert(volume.name_any(), volume);
    }

    /// Seed a PV under an arbitrary key, bypassing the name index
    pub fn insert_volume_at(&self, key: &str, mut volume: PersistentVolume) {
        let mut state = self.state.write();
        state.stamp(&mut volume);
        state.volumes.insert(key.to_string(), volume);
    }

    /// Seed a PVC
    pub fn insert_claim(&self, mut claim: PersistentVolumeClaim) {
        let mut state = self.state.write();
        state.stamp(&mut claim);
        let key = display_name(&claim.namespace().unwrap_or_default(), &claim.name_any());
        state.claims.insert(key, claim);
    }

    /// Seed a pod
    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.state.write();
        state.stamp(&mut pod);
        let key = display_name(&pod.namespace().unwrap_or_default(), &pod.name_any());
        state.pods.insert(key, pod);
    }

    /// Make every future delete of this pod fail
    pub fn deny_pod_deletion(&self, name: &str, namespace: &str) {
        self.state
            .write()
            .denied_pod_deletes
            .insert(display_name(namespace, name));
    }

    /// Make the next `count` reads of this pod fail
    pub fn fail_pod_reads(&self, name: &str, namespace: &str, count: u32) {
        self.state
            .write()
            .failing_pod_reads
            .insert(display_name(namespace, name), count);
    }

    /// Current PV, read without going through the simulated cache
    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.read().volumes.get(name).cloned()
    }

    /// Current PVC
    pub fn claim(&self, name: &str, namespace: &str) -> Option<PersistentVolumeClaim> {
        self.state
            .read()
            .claims
            .get(&display_name(namespace, name))
            .cloned()
    }

    /// Current pod
    pub fn pod(&self, name: &str, namespace: &str) -> Option<Pod> {
        self.state
            .read()
            .pods
            .get(&display_name(namespace, name))
            .cloned()
    }

    /// Every write issued so far, in order
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.read().mutations.clone()
    }

    /// Remove a PV and let the PV controller react
    fn remove_volume(&self, state: &mut ClusterState, name: &str) {
        let Some(volume) = state.volumes.remove(name) else {
            return;
        };
        debug!(pv = name, "Memory cluster: PV removed.");

        if !self.controllers.release_claims {
            return;
        }
        if let Some(claim_ref) = volume.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) {
            let key = display_name(
                claim_ref.namespace.as_deref().unwrap_or_default(),
                claim_ref.name.as_deref().unwrap_or_default(),
            );
            state.set_claim_phase(&key, "Lost");
        }
    }

    /// Drop PVs whose deletion was requested and whose finalizers are gone
    fn collect_garbage(&self, state: &mut ClusterState) {
        let doomed: Vec<String> = state
            .volumes
            .iter()
            .filter(|(_, pv)| pv.metadata.deletion_timestamp.is_some() && pv.finalizers().is_empty())
            .map(|(key, _)| key.clone())
            .collect();

        for key in doomed {
            self.remove_volume(state, &key);
        }
    }

    /// Bind the claim a freshly created PV points at, if it is waiting for one
    fn bind_claim(&self, state: &mut ClusterState, volume_name: &str) {
        if !self.controllers.bind_claims {
            return;
        }
        let Some(claim_ref) = state
            .volumes
            .get(volume_name)
            .and_then(|pv| pv.spec.as_ref())
            .and_then(|spec| spec.claim_ref.clone())
        else {
            return;
        };

        let key = display_name(
            claim_ref.namespace.as_deref().unwrap_or_default(),
            claim_ref.name.as_deref().unwrap_or_default(),
        );
        let rv = state.next_revision();
        let Some(claim) = state.claims.get_mut(&key) else {
            return;
        };

        let bound = claim.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
        if bound || claim.annotations().contains_key(ANN_BIND_COMPLETED) {
            return;
        }

        claim
            .annotations_mut()
            .insert(ANN_BIND_COMPLETED.to_string(), "yes".to_string());
        claim.spec.get_or_insert_with(Default::default).volume_name =
            Some(volume_name.to_string());
        claim
            .status
            .get_or_insert_with(PersistentVolumeClaimStatus::default)
            .phase = Some("Bound".to_string());
        claim.metadata.resource_version = Some(rv);

        if let Some(pv) = state.volumes.get_mut(volume_name) {
            pv.status.get_or_insert_with(PersistentVolumeStatus::default).phase =
                Some("Bound".to_string());
        }
        debug!(pv = volume_name, pvc = %key, "Memory cluster: PVC bound.");
    }
}

/// Apply a conditional merge patch the way the API server would
fn patch_object<K>(kind: &str, key: &str, current: &K, original: &K, updated: &K) -> Result<Option<K>>
where
    K: kube::Resource + Serialize + DeserializeOwned,
{
    if current.meta().resource_version != original.meta().resource_version {
        return Err(Error::Conflict {
            kind: kind.to_string(),
            name: key.to_string(),
        });
    }

    let Some(diff) = patch::conditional(original, updated)? else {
        return Ok(None);
    };

    let mut value = serde_json::to_value(current)?;
    patch::apply(&mut value, &diff);
    Ok(Some(serde_json::from_value(value)?))
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    async fn cached_volume(&self, name: &str) -> Result<PersistentVolume> {
        let mut state = self.state.write();
        self.collect_garbage(&mut state);

        let volume = state
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(KIND_PV, name))?;
        verify_cached(KIND_PV, name, volume)
    }

    async fn cached_claim(&self, name: &str, namespace: &str) -> Result<PersistentVolumeClaim> {
        let key = display_name(namespace, name);
        let state = self.state.read();

        let claim = state
            .claims
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(KIND_PVC, key.clone()))?;
        verify_cached(KIND_PVC, &key, claim)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .read()
            .pods
            .values()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod> {
        let key = display_name(namespace, name);
        let mut state = self.state.write();

        if let Some(remaining) = state.failing_pod_reads.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Internal(format!(
                    "the server is currently unable to handle the request (get pods {})",
                    name
                )));
            }
        }

        state
            .pods
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(KIND_POD, key))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        state.mutations.push(Mutation::DeleteVolume(name.to_string()));

        let Some(volume) = state.volumes.get(name) else {
            return Ok(());
        };

        if volume.finalizers().is_empty() {
            self.remove_volume(&mut state, name);
        } else if volume.metadata.deletion_timestamp.is_none() {
            let rv = state.next_revision();
            if let Some(volume) = state.volumes.get_mut(name) {
                volume.metadata.deletion_timestamp = Some(Time(Utc::now()));
                volume.metadata.resource_version = Some(rv);
            }
        }

        Ok(())
    }

    async fn patch_volume(
        &self,
        original: &PersistentVolume,
        updated: &PersistentVolume,
    ) -> Result<PersistentVolume> {
        let name = original.name_any();
        let mut state = self.state.write();
        state.mutations.push(Mutation::PatchVolume(name.clone()));

        let current = state
            .volumes
            .get(&name)
            .ok_or_else(|| Error::not_found(KIND_PV, name.clone()))?;

        let Some(mut patched) = patch_object(KIND_PV, &name, current, original, updated)? else {
            return Ok(current.clone());
        };

        patched.metadata.resource_version = Some(state.next_revision());
        state.volumes.insert(name, patched.clone());
        self.collect_garbage(&mut state);

        Ok(patched)
    }

    async fn patch_claim(
        &self,
        original: &PersistentVolumeClaim,
        updated: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let key = display_name(&original.namespace().unwrap_or_default(), &original.name_any());
        let mut state = self.state.write();
        state.mutations.push(Mutation::PatchClaim(key.clone()));

        let current = state
            .claims
            .get(&key)
            .ok_or_else(|| Error::not_found(KIND_PVC, key.clone()))?;

        let Some(mut patched) = patch_object(KIND_PVC, &key, current, original, updated)? else {
            return Ok(current.clone());
        };

        patched.metadata.resource_version = Some(state.next_revision());
        state.claims.insert(key, patched.clone());

        Ok(patched)
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let name = volume.name_any();
        let mut state = self.state.write();
        state.mutations.push(Mutation::CreateVolume(name.clone()));

        if state.volumes.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: KIND_PV.to_string(),
                name,
            });
        }
        if volume.metadata.resource_version.is_some() {
            return Err(Error::Internal(format!(
                "resourceVersion should not be set on objects to be created: {}",
                name
            )));
        }

        let mut created = volume.clone();
        created.metadata.deletion_timestamp = None;
        created.status = Some(PersistentVolumeStatus {
            phase: Some("Available".to_string()),
            ..Default::default()
        });
        state.stamp(&mut created);
        state.volumes.insert(name.clone(), created);
        self.bind_claim(&mut state, &name);

        state
            .volumes
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found(KIND_PV, name))
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<()> {
        let key = display_name(namespace, name);
        let mut state = self.state.write();
        state.mutations.push(Mutation::DeletePod(key.clone()));

        if state.denied_pod_deletes.contains(&key) {
            return Err(Error::Internal(format!("pods \"{}\" is forbidden", name)));
        }

        let Some(pod) = state.pods.remove(&key) else {
            return Ok(());
        };

        if self.controllers.recreate_owned_pods && !pod.owner_references().is_empty() {
            let mut replacement = pod;
            replacement.metadata.uid = None;
            replacement.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            state.stamp(&mut replacement);
            state.pods.insert(key, replacement);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn volume(name: &str, finalizers: &[&str]) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: Some(ObjectReference {
                    name: Some("pvc1".into()),
                    namespace: Some("ns".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn bound_claim() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("pvc1".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn claim_phase(gateway: &MemoryGateway) -> Option<String> {
        gateway
            .claim("pvc1", "ns")
            .and_then(|c| c.status)
            .and_then(|s| s.phase)
    }

    #[tokio::test]
    async fn test_delete_without_finalizer_releases_claim() {
        let gateway = MemoryGateway::new();
        gateway.insert_volume(volume("pv1", &[]));
        gateway.insert_claim(bound_claim());

        gateway.delete_volume("pv1").await.unwrap();

        assert!(gateway.volume("pv1").is_none());
        assert_eq!(claim_phase(&gateway).as_deref(), Some("Lost"));
    }

    #[tokio::test]
    async fn test_finalizer_pins_deleted_volume() {
        let gateway = MemoryGateway::new();
        gateway.insert_volume(volume("pv1", &["kubernetes.io/pv-protection"]));

        gateway.delete_volume("pv1").await.unwrap();
        let pinned = gateway.cached_volume("pv1").await.unwrap();
        assert!(pinned.metadata.deletion_timestamp.is_some());

        let mut cleared = pinned.clone();
        cleared.metadata.finalizers = Some(vec![]);
        gateway.patch_volume(&pinned, &cleared).await.unwrap();

        assert!(gateway.cached_volume("pv1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stale_patch_conflicts() {
        let gateway = MemoryGateway::new();
        gateway.insert_volume(volume("pv1", &["kubernetes.io/pv-protection"]));
        let stale = gateway.volume("pv1").unwrap();

        gateway.delete_volume("pv1").await.unwrap();

        let mut cleared = stale.clone();
        cleared.metadata.finalizers = Some(vec![]);
        let result = gateway.patch_volume(&stale, &cleared).await;
        assert_matches!(result, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_volume_is_idempotent() {
        let gateway = MemoryGateway::new();
        gateway.delete_volume("ghost").await.unwrap();
        assert_eq!(gateway.mutations(), vec![Mutation::DeleteVolume("ghost".into())]);
    }

    #[tokio::test]
    async fn test_create_binds_waiting_claim() {
        let gateway = MemoryGateway::new();
        let mut claim = bound_claim();
        claim.status.as_mut().unwrap().phase = Some("Lost".into());
        gateway.insert_claim(claim);

        let created = gateway.create_volume(&volume("pv1", &[])).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert_eq!(claim_phase(&gateway).as_deref(), Some("Bound"));

        let again = gateway.create_volume(&volume("pv1", &[])).await;
        assert_matches!(again, Err(Error::ResourceExists { .. }));
    }

    #[tokio::test]
    async fn test_corrupted_key_is_reported() {
        let gateway = MemoryGateway::new();
        gateway.insert_volume_at("pv1", volume("other", &[]));

        let result = gateway.cached_volume("pv1").await;
        assert_matches!(result, Err(Error::CacheCorruption { .. }));
    }
}
