//! Pods using a claim
//!
//! Pods that mount a PVC are split by ownership. Owned pods have a
//! controller that will recreate them and can be deleted by the workflow;
//! naked pods would be lost and block the upgrade.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Names of the pods mounting a claim, split by ownership
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimUsers {
    pub owned: Vec<String>,
    pub naked: Vec<String>,
}

impl ClaimUsers {
    pub fn is_empty(&self) -> bool {
        self.owned.is_empty() && self.naked.is_empty()
    }
}

/// Does the pod mount the named claim through any of its volumes
pub fn mounts_claim(pod: &Pod, claim_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map_or(false, |volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .map_or(false, |c| c.claim_name == claim_name)
            })
        })
}

/// Partition the pods of a namespace into owned and naked users of a claim.
///
/// A pod is owned if it carries at least one owner reference. Each pod is
/// listed once even if it mounts the claim through several volumes.
pub fn claim_users<'a>(pods: impl IntoIterator<Item = &'a Pod>, claim_name: &str) -> ClaimUsers {
    let mut users = ClaimUsers::default();

    for pod in pods.into_iter().filter(|p| mounts_claim(p, claim_name)) {
        if pod.owner_references().is_empty() {
            users.naked.push(pod.name_any());
        } else {
            users.owned.push(pod.name_any());
        }
    }

    users
}
