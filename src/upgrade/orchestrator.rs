//! PV Upgrader - the migration orchestrator
//!
//! Runs the upgrade of one legacy PV to a CSI PV:
//! - validates every precondition before touching the cluster
//! - deletes the legacy PV, stripping its finalizers if they pin it
//! - waits for the PVC to be Lost, then deletes the owned pods using it
//! - strips the PVC's bind-completed annotation and creates the CSI PV
//! - waits for the PVC to bind again
//!
//! The first error aborts the run. Nothing done before it is undone.

use super::config::{
    UpgradeConfig, ANN_BIND_COMPLETED, ANN_DYNAMICALLY_PROVISIONED, FINALIZER_PV_PROTECTION,
};
use super::converter::{build_csi_volume, legacy_source};
use super::guard::UpgradeGuard;
use super::metrics::UpgradeMetrics;
use super::pods::claim_users;
use super::waiters::{DeletionWaitError, ResourceWaiter};
use super::{ClaimPhase, UpgradePhase};
use crate::domain::ports::{
    ClusterGatewayRef, UpgradeVolumeRequest, VolumeRecord, VolumeRegistryRef, VolumeState,
};
use crate::error::{Error, PreconditionError, Result};
use crate::gateway::display_name;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Validated Upgrade
// =============================================================================

/// Everything validation established about the volume to upgrade
#[derive(Debug, Clone)]
struct UpgradePlan {
    record: VolumeRecord,
    volume: PersistentVolume,
    claim: PersistentVolumeClaim,
    namespace: String,
    owned_pods: Vec<String>,
}

/// Run one workflow phase, tagging any failure with the phase
async fn step<T, F>(volume: &str, phase: UpgradePhase, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    debug!(volume, phase = %phase, "PV upgrade: phase started.");
    work.await.map_err(|cause| {
        error!(volume, phase = %phase, error = %cause, "PV upgrade: phase failed.");
        Error::UpgradeFailed {
            volume: volume.to_string(),
            phase,
            source: Box::new(cause),
        }
    })
}

// =============================================================================
// PV Upgrader
// =============================================================================

/// Upgrades legacy NFS/iSCSI PVs to CSI PVs
pub struct PvUpgrader {
    config: UpgradeConfig,
    registry: VolumeRegistryRef,
    gateway: ClusterGatewayRef,
    waiter: ResourceWaiter,
    guard: UpgradeGuard,
    metrics: UpgradeMetrics,
}

impl PvUpgrader {
    /// Create an upgrader; fails if the configuration is unusable
    pub fn new(
        config: UpgradeConfig,
        registry: VolumeRegistryRef,
        gateway: ClusterGatewayRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let waiter = ResourceWaiter::new(gateway.clone(), config.backoff);

        Ok(Arc::new(Self {
            config,
            registry,
            gateway,
            waiter,
            guard: UpgradeGuard::new(),
            metrics: UpgradeMetrics::new()?,
        }))
    }

    pub fn metrics(&self) -> &UpgradeMetrics {
        &self.metrics
    }

    pub fn guard(&self) -> &UpgradeGuard {
        &self.guard
    }

    /// Upgrade one volume, returning its registry record unchanged.
    ///
    /// Fails with [`Error::MigrationInProgress`] if the same volume is
    /// already being upgraded; every other failure is an
    /// [`Error::UpgradeFailed`] naming the phase it happened in.
    pub async fn upgrade_volume(&self, request: &UpgradeVolumeRequest) -> Result<VolumeRecord> {
        info!(
            volume = %request.volume,
            migration_type = %request.migration_type,
            "PV upgrade: workflow started."
        );

        let _lease = self.guard.acquire(&request.volume)?;
        let started = tokio::time::Instant::now();

        match self.run(&request.volume).await {
            Ok(record) => {
                self.metrics.record_success(started.elapsed());
                info!(volume = %request.volume, elapsed = ?started.elapsed(), "PV upgrade: workflow complete.");
                Ok(record)
            }
            Err(err) => {
                let phase = err.phase().unwrap_or(UpgradePhase::Validating);
                self.metrics.record_failure(phase, started.elapsed());
                Err(err)
            }
        }
    }

    async fn run(&self, volume: &str) -> Result<VolumeRecord> {
        let plan = step(volume, UpgradePhase::Validating, self.validate(volume)).await?;
        let claim_name = display_name(&plan.namespace, &plan.claim.name_any());

        step(
            volume,
            UpgradePhase::DeletingLegacyVolume,
            self.delete_volume_for_upgrade(&plan.volume),
        )
        .await?;
        info!(pv = %plan.volume.name_any(), "PV upgrade: PV deleted.");

        let lost = step(
            volume,
            UpgradePhase::AwaitingClaimLost,
            self.waiter
                .wait_for_claim_phase(&plan.claim, ClaimPhase::Lost, self.config.claim_phase_wait),
        )
        .await?;
        info!(pvc = %claim_name, "PV upgrade: PVC reached the Lost state.");

        step(
            volume,
            UpgradePhase::DeletingOwnedPods,
            self.delete_owned_pods(&plan.namespace, &plan.owned_pods),
        )
        .await?;

        step(
            volume,
            UpgradePhase::AwaitingPodsTerminal,
            self.wait_for_pods_terminal(&plan.namespace, &plan.owned_pods),
        )
        .await?;

        let unbound = step(
            volume,
            UpgradePhase::StrippingBindAnnotation,
            self.remove_bind_completed_annotation(&lost),
        )
        .await?;
        info!(pvc = %claim_name, "PV upgrade: removed bind-completed annotation from PVC.");

        let csi_pv = step(
            volume,
            UpgradePhase::CreatingCsiVolume,
            self.create_csi_volume(&plan.volume, &plan.record),
        )
        .await?;
        info!(pv = %csi_pv.name_any(), "PV upgrade: created CSI version of PV.");

        step(
            volume,
            UpgradePhase::AwaitingClaimBound,
            self.waiter
                .wait_for_claim_phase(&unbound, ClaimPhase::Bound, self.config.claim_phase_wait),
        )
        .await?;
        info!(pv = %csi_pv.name_any(), pvc = %claim_name, "PV upgrade: PVC bound.");

        Ok(plan.record)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    async fn validate(&self, volume: &str) -> Result<UpgradePlan> {
        let record = self.registry.get_volume(volume).await.map_err(|e| {
            if e.is_not_found() {
                Error::from(PreconditionError::VolumeNotFound {
                    volume: volume.to_string(),
                    reason: e.to_string(),
                })
            } else {
                e
            }
        })?;
        debug!(volume = %record.name, "PV upgrade: volume found.");

        if record.state != VolumeState::Online {
            return Err(PreconditionError::VolumeNotOnline {
                volume: record.name.clone(),
                state: record.state,
            }
            .into());
        }

        let pv = self.gateway.cached_volume(volume).await.map_err(|e| {
            if e.is_not_found() {
                Error::from(PreconditionError::PvNotFound {
                    name: volume.to_string(),
                })
            } else {
                e
            }
        })?;
        let pv_name = pv.name_any();

        let source = legacy_source(&pv)?;
        debug!(pv = %pv_name, kind = source.kind(), "PV upgrade: legacy source found.");

        let pv_phase = pv
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();
        if pv_phase != "Bound" {
            return Err(PreconditionError::PvNotBound {
                name: pv_name,
                phase: pv_phase,
            }
            .into());
        }

        let provisioner = pv.annotations().get(ANN_DYNAMICALLY_PROVISIONED).cloned();
        if provisioner.as_deref() != Some(self.config.legacy_provisioner.as_str()) {
            return Err(PreconditionError::WrongProvisioner {
                name: pv_name,
                expected: self.config.legacy_provisioner.clone(),
                found: provisioner,
            }
            .into());
        }

        let claim_ref = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
        let (Some(claim_name), Some(namespace)) = (
            claim_ref.and_then(|r| r.name.clone()),
            claim_ref.and_then(|r| r.namespace.clone()),
        ) else {
            return Err(PreconditionError::MissingClaimRef { name: pv_name }.into());
        };
        let claim_display = display_name(&namespace, &claim_name);

        let claim = self
            .gateway
            .cached_claim(&claim_name, &namespace)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::from(PreconditionError::ClaimNotFound {
                        name: pv_name.clone(),
                        claim: claim_display.clone(),
                    })
                } else {
                    e
                }
            })?;

        let claim_phase = claim
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();
        if claim_phase != ClaimPhase::Bound.as_str() {
            return Err(PreconditionError::ClaimNotBound {
                claim: claim_display,
                phase: claim_phase,
            }
            .into());
        }

        let pods = self.gateway.list_pods(&namespace).await?;
        let users = claim_users(&pods, &claim_name);
        if !users.naked.is_empty() {
            return Err(PreconditionError::NakedPods {
                claim: claim_display,
                pods: users.naked,
            }
            .into());
        }
        if users.owned.is_empty() {
            info!(pv = %pv_name, pvc = %claim_display, "PV upgrade: no owned pods are using the PV.");
        } else {
            info!(
                pv = %pv_name,
                pvc = %claim_display,
                pods = %users.owned.join(","),
                "PV upgrade: one or more owned pods are using the PV."
            );
        }

        let finalizers = pv.finalizers();
        let allowed = finalizers.is_empty()
            || (finalizers.len() == 1 && finalizers[0] == FINALIZER_PV_PROTECTION);
        if !allowed {
            return Err(PreconditionError::DisallowedFinalizers {
                name: pv_name,
                allowed: FINALIZER_PV_PROTECTION.to_string(),
                finalizers: finalizers.to_vec(),
            }
            .into());
        }

        Ok(UpgradePlan {
            record,
            volume: pv,
            claim,
            namespace,
            owned_pods: users.owned,
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Delete a PV and wait until it is gone, removing finalizers that pin it.
    ///
    /// Safe to call again on a PV whose deletion was already requested.
    pub async fn delete_volume_for_upgrade(&self, pv: &PersistentVolume) -> Result<()> {
        let name = pv.name_any();
        let wait = self.config.volume_delete_wait;

        if pv.metadata.deletion_timestamp.is_none() {
            self.gateway.delete_volume(&name).await?;
            debug!(pv = %name, "PV upgrade: PV delete requested.");

            let marked = match self.waiter.wait_for_deletion_marker(&name, wait).await {
                Ok(marked) => marked,
                Err(DeletionWaitError { last_seen, error }) => {
                    warn!(
                        pv = %name,
                        still_listed = last_seen.is_some(),
                        "PV upgrade: PV deletion was not observed."
                    );
                    return Err(error);
                }
            };

            if let Some(marked) = marked.filter(|pv| !pv.finalizers().is_empty()) {
                self.remove_volume_finalizers(&marked).await?;
            }
        } else if !pv.finalizers().is_empty() {
            debug!(pv = %name, "PV upgrade: PV already being deleted.");
            self.remove_volume_finalizers(pv).await?;
        }

        self.waiter.wait_for_volume_disappearance(&name, wait).await
    }

    async fn remove_volume_finalizers(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let mut cleared = pv.clone();
        cleared.metadata.finalizers = Some(Vec::new());

        let patched = self.gateway.patch_volume(pv, &cleared).await.map_err(|e| {
            error!(pv = %pv.name_any(), error = %e, "PV upgrade: could not remove finalizers from PV.");
            e
        })?;
        info!(pv = %pv.name_any(), "PV upgrade: removed finalizers from PV.");
        Ok(patched)
    }

    /// Delete pods one at a time, stopping at the first failure
    async fn delete_owned_pods(&self, namespace: &str, pods: &[String]) -> Result<()> {
        for pod in pods {
            self.gateway.delete_pod(pod, namespace).await?;
            info!(pod = %display_name(namespace, pod), "PV upgrade: owned pod deleted.");
        }
        Ok(())
    }

    async fn wait_for_pods_terminal(&self, namespace: &str, pods: &[String]) -> Result<()> {
        for pod in pods {
            self.waiter
                .wait_for_pod_terminal(pod, namespace, self.config.pod_delete_wait)
                .await?;
            info!(pod = %display_name(namespace, pod), "PV upgrade: pod deleted or not running.");
        }
        Ok(())
    }

    async fn remove_bind_completed_annotation(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let mut unbound = claim.clone();
        unbound.annotations_mut().remove(ANN_BIND_COMPLETED);
        self.gateway.patch_claim(claim, &unbound).await
    }

    async fn create_csi_volume(
        &self,
        pv: &PersistentVolume,
        record: &VolumeRecord,
    ) -> Result<PersistentVolume> {
        let csi_pv = build_csi_volume(pv, record, &self.config.csi_driver)?;
        self.gateway.create_volume(&csi_pv).await
    }
}
