//! Kubernetes Cluster Gateway
//!
//! Live adapter for the cluster gateway port. PVs and PVCs are read from
//! reflector stores kept current by background watches; pods are always
//! read from the API server because their state changes too quickly for a
//! cached view. Writes go straight to the API server.

use super::{display_name, patch, verify_cached, KIND_POD, KIND_PV, KIND_PVC};
use crate::domain::ports::ClusterGateway;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Kubernetes gateway
#[derive(Debug, Clone)]
pub struct KubeGatewayConfig {
    /// How long to wait for the initial list of each watched kind
    pub cache_sync_timeout: Duration,
    /// Field manager recorded on patches
    pub field_manager: String,
}

impl Default for KubeGatewayConfig {
    fn default() -> Self {
        Self {
            cache_sync_timeout: Duration::from_secs(60),
            field_manager: "pv-upgrade-operator".to_string(),
        }
    }
}

// =============================================================================
// Kube Gateway
// =============================================================================

/// Cluster gateway backed by a Kubernetes client
pub struct KubeGateway {
    client: Client,
    config: KubeGatewayConfig,
    volumes: Store<PersistentVolume>,
    claims: Store<PersistentVolumeClaim>,
    watchers: Vec<JoinHandle<()>>,
}

impl KubeGateway {
    /// Start the PV and PVC watches and wait for both caches to sync
    pub async fn start(client: Client, config: KubeGatewayConfig) -> Result<Self> {
        info!("Starting PV and PVC watches");

        let (volumes, volume_watch) =
            spawn_reflector(Api::<PersistentVolume>::all(client.clone()), KIND_PV);
        let (claims, claim_watch) =
            spawn_reflector(Api::<PersistentVolumeClaim>::all(client.clone()), KIND_PVC);

        let gateway = Self {
            client,
            config,
            volumes,
            claims,
            watchers: vec![volume_watch, claim_watch],
        };

        wait_for_sync(&gateway.volumes, KIND_PV, gateway.config.cache_sync_timeout).await?;
        wait_for_sync(&gateway.claims, KIND_PVC, gateway.config.cache_sync_timeout).await?;

        info!(
            volumes = gateway.volumes.state().len(),
            claims = gateway.claims.state().len(),
            "PV and PVC caches synced"
        );
        Ok(gateway)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.config.field_manager.clone()),
            ..Default::default()
        }
    }
}

impl Drop for KubeGateway {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

/// Run a reflector for `api` in the background and return its store
fn spawn_reflector<K>(api: Api<K>, kind: &'static str) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects();

    let handle = tokio::spawn(async move {
        stream
            .for_each(|event| async move {
                match event {
                    Ok(object) => debug!(kind, name = %object.name_any(), "Cache updated."),
                    Err(e) => warn!(kind, error = %e, "Watch error, retrying."),
                }
            })
            .await;
        warn!(kind, "Watch stream ended.");
    });

    (reader, handle)
}

async fn wait_for_sync<K>(store: &Store<K>, kind: &str, timeout: Duration) -> Result<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    match tokio::time::timeout(timeout, store.wait_until_ready()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::CacheSync {
            kind: kind.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::CacheSync {
            kind: kind.to_string(),
            reason: format!("not synced after {:?}", timeout),
        }),
    }
}

/// Translate an API answer into the gateway's error vocabulary
fn classify(kind: &str, name: &str, err: kube::Error) -> Error {
    if let kube::Error::Api(ae) = &err {
        match ae.code {
            404 => return Error::not_found(kind, name),
            409 if ae.reason == "AlreadyExists" => {
                return Error::ResourceExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            409 => {
                return Error::Conflict {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            _ => {}
        }
    }
    Error::Kube(err)
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn cached_volume(&self, name: &str) -> Result<PersistentVolume> {
        let volume = self
            .volumes
            .get(&ObjectRef::new(name))
            .ok_or_else(|| Error::not_found(KIND_PV, name))?;
        verify_cached(KIND_PV, name, volume.as_ref().clone())
    }

    async fn cached_claim(&self, name: &str, namespace: &str) -> Result<PersistentVolumeClaim> {
        let key = display_name(namespace, name);
        let claim = self
            .claims
            .get(&ObjectRef::new(name).within(namespace))
            .ok_or_else(|| Error::not_found(KIND_PVC, key.clone()))?;
        verify_cached(KIND_PVC, &key, claim.as_ref().clone())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let list = self.pods(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| classify(KIND_POD, &display_name(namespace, name), e))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pv = name, "PV already gone.");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_volume(
        &self,
        original: &PersistentVolume,
        updated: &PersistentVolume,
    ) -> Result<PersistentVolume> {
        let name = original.name_any();
        let api: Api<PersistentVolume> = Api::all(self.client.clone());

        let Some(diff) = patch::conditional(original, updated)? else {
            return Ok(original.clone());
        };

        api.patch(&name, &self.patch_params(), &Patch::Merge(&diff))
            .await
            .map_err(|e| classify(KIND_PV, &name, e))
    }

    async fn patch_claim(
        &self,
        original: &PersistentVolumeClaim,
        updated: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let name = original.name_any();
        let namespace = original.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);

        let Some(diff) = patch::conditional(original, updated)? else {
            return Ok(original.clone());
        };

        api.patch(&name, &self.patch_params(), &Patch::Merge(&diff))
            .await
            .map_err(|e| classify(KIND_PVC, &display_name(&namespace, &name), e))
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let params = PostParams {
            field_manager: Some(self.config.field_manager.clone()),
            ..Default::default()
        };

        api.create(&params, volume)
            .await
            .map_err(|e| classify(KIND_PV, &volume.name_any(), e))
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<()> {
        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %display_name(namespace, name), "Pod already gone.");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
