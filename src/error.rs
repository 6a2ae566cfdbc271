//! Error types for the PV Upgrade Operator
//!
//! Provides structured error types for the upgrade workflow, the cluster
//! gateway, the volume registry and the REST frontend.

use crate::domain::ports::VolumeState;
use crate::upgrade::UpgradePhase;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflict updating {kind}/{name}: object was modified")]
    Conflict { kind: String, name: String },

    #[error("non-{kind} object {found} found in cache under key {key}")]
    CacheCorruption {
        kind: String,
        key: String,
        found: String,
    },

    #[error("Cache for {kind} did not sync: {reason}")]
    CacheSync { kind: String, reason: String },

    // =========================================================================
    // Upgrade Errors
    // =========================================================================
    #[error("PV upgrade precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("{resource} was not {condition} after {seconds:.2} seconds")]
    WaitTimeout {
        resource: String,
        condition: String,
        seconds: f64,
    },

    #[error("PV upgrade of volume {volume} failed while {phase}: {source}")]
    UpgradeFailed {
        volume: String,
        phase: UpgradePhase,
        #[source]
        source: Box<Error>,
    },

    #[error("Migration already in progress for volume {volume_name}")]
    MigrationInProgress { volume_name: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Volume registry connection error: {0}")]
    RegistryConnection(#[from] reqwest::Error),

    #[error("Volume registry returned {status}: {message}")]
    RegistryResponse { status: u16, message: String },

    // =========================================================================
    // Parse / Metrics / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A validation failure detected before any cluster mutation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreconditionError {
    #[error("unsupported upgrade type {0:?}, only \"csi\" is supported")]
    UnsupportedMigrationType(String),

    #[error("could not find the volume to upgrade {volume}: {reason}")]
    VolumeNotFound { volume: String, reason: String },

    #[error("volume {volume} must be in online state, found {state}")]
    VolumeNotOnline { volume: String, state: VolumeState },

    #[error("could not find the PV {name} to upgrade")]
    PvNotFound { name: String },

    #[error("PV {name} must be of type NFS or iSCSI")]
    NoLegacySource { name: String },

    #[error("PV {name} carries both an NFS and an iSCSI source")]
    AmbiguousLegacySource { name: String },

    #[error("PV {name} must be bound to a PVC, phase is {phase}")]
    PvNotBound { name: String, phase: String },

    #[error("PV {name} has no claim reference")]
    MissingClaimRef { name: String },

    #[error("PV {name} must have been provisioned by {expected}, found {found:?}")]
    WrongProvisioner {
        name: String,
        expected: String,
        found: Option<String>,
    },

    #[error("could not find the PVC {claim} bound to PV {name}")]
    ClaimNotFound { name: String, claim: String },

    #[error("PVC {claim} must be Bound, phase is {phase}")]
    ClaimNotBound { claim: String, phase: String },

    #[error(
        "one or more naked pods are using the PV ({}); shut down these pods manually and try again",
        pods.join(",")
    )]
    NakedPods { claim: String, pods: Vec<String> },

    #[error("PV {name} has a finalizer other than {allowed}: [{}]", finalizers.join(","))]
    DisallowedFinalizers {
        name: String,
        allowed: String,
        finalizers: Vec<String>,
    },
}

impl Error {
    /// Shorthand for a not-found error of the given kind
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Phase in which an upgrade failed, if this error came out of the workflow
    pub fn phase(&self) -> Option<UpgradePhase> {
        match self {
            Error::UpgradeFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Underlying cause with any workflow wrapping removed
    pub fn cause(&self) -> &Error {
        match self {
            Error::UpgradeFailed { source, .. } => source.cause(),
            other => other,
        }
    }

    /// The precondition that rejected the upgrade, if any
    pub fn precondition(&self) -> Option<&PreconditionError> {
        match self.cause() {
            Error::Precondition(p) => Some(p),
            _ => None,
        }
    }

    /// Check if this is a not-found answer, from the cluster or from validation
    pub fn is_not_found(&self) -> bool {
        match self.cause() {
            Error::ResourceNotFound { .. } => true,
            Error::Precondition(p) => p.is_not_found(),
            _ => false,
        }
    }
}

impl PreconditionError {
    /// Whether the upgrade was rejected because something does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PreconditionError::VolumeNotFound { .. }
                | PreconditionError::PvNotFound { .. }
                | PreconditionError::ClaimNotFound { .. }
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
