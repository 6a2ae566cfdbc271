//! PV Upgrade Workflow
//!
//! Converts a legacy NFS or iSCSI PersistentVolume into a CSI
//! PersistentVolume in place, while its claim stays bound to the same name.
//!
//! # Workflow
//!
//! ```text
//!  Validating
//!      │  registry record online, PV legacy + bound + ours,
//!      │  claim bound, no naked pods, only pv-protection finalizer
//!      ▼
//!  DeletingLegacyVolume ──► AwaitingClaimLost ──► DeletingOwnedPods
//!                                                        │
//!      ┌─────────────────────────────────────────────────┘
//!      ▼
//!  AwaitingPodsTerminal ──► StrippingBindAnnotation ──► CreatingCsiVolume
//!                                                        │
//!                                  AwaitingClaimBound ◄──┘
//!                                         │
//!                                         ▼
//!                                        Done
//! ```
//!
//! Every step after validation mutates the cluster and is not undone if a
//! later step fails.

pub mod config;
pub mod converter;
pub mod guard;
pub mod metrics;
pub mod orchestrator;
pub mod pods;
pub mod poller;
pub mod waiters;

pub use config::{BackoffConfig, UpgradeConfig};
pub use guard::{UpgradeGuard, UpgradeLease};
pub use metrics::UpgradeMetrics;
pub use orchestrator::PvUpgrader;
pub use waiters::ResourceWaiter;

use serde::{Deserialize, Serialize};

// =============================================================================
// Workflow Phases
// =============================================================================

/// Step of the upgrade workflow, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    Validating,
    DeletingLegacyVolume,
    AwaitingClaimLost,
    DeletingOwnedPods,
    AwaitingPodsTerminal,
    StrippingBindAnnotation,
    CreatingCsiVolume,
    AwaitingClaimBound,
    Done,
}

impl UpgradePhase {
    /// All phases in execution order
    pub const ALL: [UpgradePhase; 9] = [
        UpgradePhase::Validating,
        UpgradePhase::DeletingLegacyVolume,
        UpgradePhase::AwaitingClaimLost,
        UpgradePhase::DeletingOwnedPods,
        UpgradePhase::AwaitingPodsTerminal,
        UpgradePhase::StrippingBindAnnotation,
        UpgradePhase::CreatingCsiVolume,
        UpgradePhase::AwaitingClaimBound,
        UpgradePhase::Done,
    ];

    /// Label value used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradePhase::Validating => "validating",
            UpgradePhase::DeletingLegacyVolume => "deleting_legacy_volume",
            UpgradePhase::AwaitingClaimLost => "awaiting_claim_lost",
            UpgradePhase::DeletingOwnedPods => "deleting_owned_pods",
            UpgradePhase::AwaitingPodsTerminal => "awaiting_pods_terminal",
            UpgradePhase::StrippingBindAnnotation => "stripping_bind_annotation",
            UpgradePhase::CreatingCsiVolume => "creating_csi_volume",
            UpgradePhase::AwaitingClaimBound => "awaiting_claim_bound",
            UpgradePhase::Done => "done",
        }
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            UpgradePhase::Validating => "validating preconditions",
            UpgradePhase::DeletingLegacyVolume => "deleting the legacy PV",
            UpgradePhase::AwaitingClaimLost => "waiting for the PVC to be Lost",
            UpgradePhase::DeletingOwnedPods => "deleting owned pods",
            UpgradePhase::AwaitingPodsTerminal => "waiting for deleted pods to stop",
            UpgradePhase::StrippingBindAnnotation => "removing the PVC bind-completed annotation",
            UpgradePhase::CreatingCsiVolume => "creating the CSI PV",
            UpgradePhase::AwaitingClaimBound => "waiting for the PVC to be Bound",
            UpgradePhase::Done => "done",
        };
        write!(f, "{}", text)
    }
}

// =============================================================================
// Claim Phases
// =============================================================================

/// PVC phases the workflow waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimPhase {
    Bound,
    Lost,
}

impl ClaimPhase {
    /// Name as it appears in `status.phase`
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimPhase::Bound => "Bound",
            ClaimPhase::Lost => "Lost",
        }
    }
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
