//! Upgrade Configuration
//!
//! Timing and identity settings for the PV upgrade workflow. One
//! [`BackoffConfig`] is shared by every waiter; only the per-wait deadline
//! differs between them.

use crate::error::{Error, Result};
use std::time::Duration;

// =============================================================================
// Well-known Kubernetes names
// =============================================================================

/// Annotation naming the provisioner that created a PV
pub const ANN_DYNAMICALLY_PROVISIONED: &str = "pv.kubernetes.io/provisioned-by";

/// Annotation set by the PV controller once a PVC is bound
pub const ANN_BIND_COMPLETED: &str = "pv.kubernetes.io/bind-completed";

/// The only finalizer a PV may carry when an upgrade starts
pub const FINALIZER_PV_PROTECTION: &str = "kubernetes.io/pv-protection";

/// Keys of the CSI volume attributes built from the registry record
pub const ATTR_BACKEND_UUID: &str = "backendUUID";
pub const ATTR_NAME: &str = "name";
pub const ATTR_INTERNAL_NAME: &str = "internalName";
pub const ATTR_PROTOCOL: &str = "protocol";

// =============================================================================
// Backoff Configuration
// =============================================================================

/// Exponential backoff shared by all resource waiters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// First sleep between attempts
    pub initial_interval: Duration,
    /// Jitter applied to each interval, in [0, 1]
    pub randomization_factor: f64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Ceiling for a single sleep
    pub max_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            randomization_factor: 0.1,
            multiplier: 1.414,
            max_interval: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() {
            return Err(Error::Configuration(
                "backoff initial interval must be positive".into(),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(Error::Configuration(format!(
                "backoff max interval {:?} is shorter than initial interval {:?}",
                self.max_interval, self.initial_interval
            )));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(Error::Configuration(format!(
                "backoff randomization factor {} must be within [0, 1]",
                self.randomization_factor
            )));
        }
        if !(self.multiplier >= 1.0) {
            return Err(Error::Configuration(format!(
                "backoff multiplier {} must be at least 1",
                self.multiplier
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Upgrade Configuration
// =============================================================================

/// Configuration for the upgrade workflow
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Backoff shared by all waiters
    pub backoff: BackoffConfig,
    /// Deadline for a PV to be marked deleted and then disappear
    pub volume_delete_wait: Duration,
    /// Deadline for each deleted pod to disappear or stop running
    pub pod_delete_wait: Duration,
    /// Deadline for a PVC to reach Lost or Bound
    pub claim_phase_wait: Duration,
    /// CSI driver that will serve the upgraded PV
    pub csi_driver: String,
    /// Provisioner annotation value the legacy PV must carry
    pub legacy_provisioner: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            volume_delete_wait: Duration::from_secs(30),
            pod_delete_wait: Duration::from_secs(60),
            claim_phase_wait: Duration::from_secs(30),
            csi_driver: "csi.trident.netapp.io".to_string(),
            legacy_provisioner: "netapp.io/trident".to_string(),
        }
    }
}

impl UpgradeConfig {
    /// Check the configuration for values the workflow cannot run with
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()?;

        for (name, wait) in [
            ("volume delete wait", self.volume_delete_wait),
            ("pod delete wait", self.pod_delete_wait),
            ("claim phase wait", self.claim_phase_wait),
        ] {
            if wait.is_zero() {
                return Err(Error::Configuration(format!("{} must be positive", name)));
            }
        }

        if self.csi_driver.trim().is_empty() {
            return Err(Error::Configuration("CSI driver name is empty".into()));
        }
        if self.legacy_provisioner.trim().is_empty() {
            return Err(Error::Configuration("legacy provisioner name is empty".into()));
        }
        if self.csi_driver == self.legacy_provisioner {
            return Err(Error::Configuration(format!(
                "CSI driver and legacy provisioner are both {}",
                self.csi_driver
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = UpgradeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.backoff.initial_interval, Duration::from_secs(1));
        assert_eq!(config.pod_delete_wait, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let mut config = UpgradeConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = UpgradeConfig::default();
        config.backoff.randomization_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = UpgradeConfig::default();
        config.backoff.max_interval = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_wait() {
        let mut config = UpgradeConfig::default();
        config.claim_phase_wait = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_same_identities() {
        let mut config = UpgradeConfig::default();
        config.legacy_provisioner = config.csi_driver.clone();
        assert!(config.validate().is_err());
    }
}
