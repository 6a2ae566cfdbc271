//! Resource State Waiters
//!
//! Condition checks layered on the backoff poller. PV and PVC conditions
//! are read from the gateway's cache, which has a reliable watch feed; pod
//! conditions are read live because pod state moves faster than the cache
//! can be trusted to follow. All waiters share one backoff configuration
//! and differ only in their deadline.

use super::config::BackoffConfig;
use super::poller::{poll_until, Probe, WaitTarget};
use super::ClaimPhase;
use crate::domain::ports::ClusterGatewayRef;
use crate::error::{Error, Result};
use crate::gateway::display_name;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::info;

/// Pod phase that keeps a pod from counting as stopped
const POD_RUNNING: &str = "Running";

/// Failure of [`ResourceWaiter::wait_for_deletion_marker`].
///
/// Carries the last copy of the PV seen in the cache, if any, so the caller
/// can decide what to do with a PV that never got its deletion timestamp.
#[derive(Debug)]
pub struct DeletionWaitError {
    pub last_seen: Option<PersistentVolume>,
    pub error: Error,
}

impl std::fmt::Display for DeletionWaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for DeletionWaitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<DeletionWaitError> for Error {
    fn from(err: DeletionWaitError) -> Self {
        err.error
    }
}

/// Map a failed read to a probe outcome: corruption stops polling, anything
/// else is retried
fn retry_unless_corrupt<T>(err: Error) -> Probe<T> {
    match err {
        Error::CacheCorruption { .. } => Probe::Fatal(err),
        other => Probe::Pending(other.to_string()),
    }
}

/// Waits for PVs, PVCs and pods to reach a state
#[derive(Clone)]
pub struct ResourceWaiter {
    gateway: ClusterGatewayRef,
    backoff: BackoffConfig,
}

impl ResourceWaiter {
    pub fn new(gateway: ClusterGatewayRef, backoff: BackoffConfig) -> Self {
        Self { gateway, backoff }
    }

    /// Wait until the PV is gone from the cache
    pub async fn wait_for_volume_disappearance(&self, name: &str, deadline: Duration) -> Result<()> {
        let gateway = &self.gateway;
        let target = WaitTarget::new(format!("PV {}", name), "fully deleted");

        poll_until(&self.backoff, deadline, &target, || async move {
            match gateway.cached_volume(name).await {
                Ok(_) => Probe::Pending(format!("PV {} still exists", name)),
                Err(e) if e.is_not_found() => Probe::Ready(()),
                Err(e) => retry_unless_corrupt(e),
            }
        })
        .await
    }

    /// Wait until the PV either disappears or shows a deletion timestamp.
    ///
    /// Returns `None` if the PV disappeared and `Some(pv)` if it is still
    /// listed with its deletion timestamp set, typically because a finalizer
    /// pins it.
    pub async fn wait_for_deletion_marker(
        &self,
        name: &str,
        deadline: Duration,
    ) -> std::result::Result<Option<PersistentVolume>, DeletionWaitError> {
        let gateway = &self.gateway;
        let last_seen: Mutex<Option<PersistentVolume>> = Mutex::new(None);
        let last = &last_seen;
        let target = WaitTarget::new(format!("PV {}", name), "deleted");

        let outcome = poll_until(&self.backoff, deadline, &target, || async move {
            *last.lock() = None;
            match gateway.cached_volume(name).await {
                Ok(pv) if pv.metadata.deletion_timestamp.is_some() => Probe::Ready(Some(pv)),
                Ok(pv) => {
                    *last.lock() = Some(pv);
                    Probe::Pending(format!("PV {} deletion timestamp not set", name))
                }
                Err(e) if e.is_not_found() => Probe::Ready(None),
                Err(e) => retry_unless_corrupt(e),
            }
        })
        .await;

        outcome.map_err(|error| DeletionWaitError {
            last_seen: last_seen.into_inner(),
            error,
        })
    }

    /// Wait until the PVC reaches `phase`, returning its freshest copy
    pub async fn wait_for_claim_phase(
        &self,
        claim: &PersistentVolumeClaim,
        phase: ClaimPhase,
        deadline: Duration,
    ) -> Result<PersistentVolumeClaim> {
        let gateway = &self.gateway;
        let name = claim.name_any();
        let namespace = claim.namespace().unwrap_or_default();
        let (name, namespace) = (name.as_str(), namespace.as_str());
        let target = WaitTarget::new(format!("PVC {}", display_name(namespace, name)), phase.as_str());

        poll_until(&self.backoff, deadline, &target, || async move {
            match gateway.cached_claim(name, namespace).await {
                Ok(latest) => {
                    let current = latest
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.clone())
                        .unwrap_or_default();
                    if current == phase.as_str() {
                        Probe::Ready(latest)
                    } else {
                        Probe::Pending(format!(
                            "PVC {} is {:?}, not yet {}",
                            display_name(namespace, name),
                            current,
                            phase
                        ))
                    }
                }
                Err(e) => retry_unless_corrupt(e),
            }
        })
        .await
    }

    /// Wait until the pod is gone or out of the Running phase.
    ///
    /// Reads the API server directly. Returns the pod if it still exists.
    pub async fn wait_for_pod_terminal(
        &self,
        name: &str,
        namespace: &str,
        deadline: Duration,
    ) -> Result<Option<Pod>> {
        let gateway = &self.gateway;
        let target = WaitTarget::new(
            format!("pod {}", display_name(namespace, name)),
            "deleted or non-Running",
        );

        poll_until(&self.backoff, deadline, &target, || async move {
            match gateway.get_pod(name, namespace).await {
                Ok(pod) => {
                    let phase = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.clone())
                        .unwrap_or_default();
                    if phase == POD_RUNNING {
                        Probe::Pending(format!(
                            "pod {} phase is {}",
                            display_name(namespace, name),
                            phase
                        ))
                    } else {
                        info!(pod = %display_name(namespace, name), phase = %phase, "Pod is not running.");
                        Probe::Ready(Some(pod))
                    }
                }
                Err(e) if e.is_not_found() => {
                    info!(pod = %display_name(namespace, name), "Pod not found.");
                    Probe::Ready(None)
                }
                // the API may be briefly unavailable; keep trying until the deadline
                Err(e) => Probe::Pending(e.to_string()),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ClusterGateway;
    use crate::gateway::MemoryGateway;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolumeClaimStatus, PersistentVolumeSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::sync::Arc;

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

    fn claim(phase: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("pvc1".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: "ReplicaSet".into(),
                    name: "rs1".into(),
                    uid: "rs-uid".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MemoryGateway>, ResourceWaiter) {
        let gateway = Arc::new(MemoryGateway::new());
        let waiter = ResourceWaiter::new(gateway.clone(), BackoffConfig::default());
        (gateway, waiter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_disappearance_of_missing_volume() {
        let (_, waiter) = setup();
        waiter
            .wait_for_volume_disappearance("pv1", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disappearance_times_out() {
        let (gateway, waiter) = setup();
        gateway.insert_volume(volume("pv1", &[]));

        let err = waiter
            .wait_for_volume_disappearance("pv1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "PV pv1 was not fully deleted after 5.00 seconds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_cache_is_fatal() {
        let (gateway, waiter) = setup();
        gateway.insert_volume_at("pv1", volume("pv2", &[]));
        let started = tokio::time::Instant::now();

        let err = waiter
            .wait_for_volume_disappearance("pv1", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_matches!(err, Error::CacheCorruption { .. });
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_marker_on_pinned_volume() {
        let (gateway, waiter) = setup();
        gateway.insert_volume(volume("pv1", &["kubernetes.io/pv-protection"]));
        gateway.delete_volume("pv1").await.unwrap();

        let marked = waiter
            .wait_for_deletion_marker("pv1", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("pinned PV stays listed");
        assert!(marked.metadata.deletion_timestamp.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_marker_timeout_keeps_last_seen() {
        let (gateway, waiter) = setup();
        gateway.insert_volume(volume("pv1", &[]));

        let err = waiter
            .wait_for_deletion_marker("pv1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.last_seen.map(|pv| pv.name_any()).as_deref(), Some("pv1"));
        assert_eq!(err.error.to_string(), "PV pv1 was not deleted after 5.00 seconds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_phase_follows_volume_removal() {
        let (gateway, waiter) = setup();
        gateway.insert_volume(volume("pv1", &[]));
        gateway.insert_claim(claim("Bound"));
        let pvc = gateway.claim("pvc1", "ns").unwrap();

        let remover = gateway.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            remover.delete_volume("pv1").await.unwrap();
        });

        let lost = waiter
            .wait_for_claim_phase(&pvc, ClaimPhase::Lost, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(lost.status.unwrap().phase.as_deref(), Some("Lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_phase_timeout_names_claim() {
        let (gateway, waiter) = setup();
        gateway.insert_claim(claim("Bound"));

        let err = waiter
            .wait_for_claim_phase(&claim("Bound"), ClaimPhase::Lost, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "PVC ns/pvc1 was not Lost after 30.00 seconds");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_terminal_states() {
        let (gateway, waiter) = setup();
        gateway.insert_pod(pod("pending", "Pending"));
        gateway.insert_pod(pod("running", "Running"));

        let gone = waiter
            .wait_for_pod_terminal("gone", "ns", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(gone.is_none());

        let pending = waiter
            .wait_for_pod_terminal("pending", "ns", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(pending.is_some());

        let err = waiter
            .wait_for_pod_terminal("running", "ns", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_matches!(err, Error::WaitTimeout { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_read_errors_are_retried() {
        let (gateway, waiter) = setup();
        gateway.fail_pod_reads("gone", "ns", 3);

        let gone = waiter
            .wait_for_pod_terminal("gone", "ns", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(gone.is_none());

        gateway.insert_pod(pod("pending", "Pending"));
        gateway.fail_pod_reads("pending", "ns", 2);
        let pending = waiter
            .wait_for_pod_terminal("pending", "ns", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_read_errors_until_deadline_time_out() {
        let (gateway, waiter) = setup();
        gateway.fail_pod_reads("flaky", "ns", u32::MAX);

        let err = waiter
            .wait_for_pod_terminal("flaky", "ns", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_matches!(err, Error::WaitTimeout { .. });
    }
}
