//! Per-volume upgrade lease
//!
//! Keeps two upgrades of the same volume from running at once in this
//! process. A lease is taken before validation and released when it is
//! dropped, whatever the outcome of the upgrade.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of volumes with an upgrade in flight
#[derive(Debug, Clone, Default)]
pub struct UpgradeGuard {
    active: Arc<DashMap<String, DateTime<Utc>>>,
}

impl UpgradeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `volume`, or fail if another upgrade holds it
    pub fn acquire(&self, volume: &str) -> Result<UpgradeLease> {
        match self.active.entry(volume.to_string()) {
            Entry::Occupied(held) => {
                debug!(volume, since = %held.get(), "Upgrade lease is held.");
                Err(Error::MigrationInProgress {
                    volume_name: volume.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(UpgradeLease {
                    volume: volume.to_string(),
                    active: Arc::clone(&self.active),
                })
            }
        }
    }

    pub fn is_active(&self, volume: &str) -> bool {
        self.active.contains_key(volume)
    }
}

/// Held while a volume is being upgraded
#[derive(Debug)]
pub struct UpgradeLease {
    volume: String,
    active: Arc<DashMap<String, DateTime<Utc>>>,
}

impl Drop for UpgradeLease {
    fn drop(&mut self) {
        self.active.remove(&self.volume);
        debug!(volume = %self.volume, "Upgrade lease released.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_second_acquire_fails() {
        let guard = UpgradeGuard::new();
        let _lease = guard.acquire("vol1").unwrap();

        assert_matches!(
            guard.acquire("vol1"),
            Err(Error::MigrationInProgress { volume_name }) if volume_name == "vol1"
        );
        // other volumes are independent
        let _other = guard.acquire("vol2").unwrap();
        assert!(guard.is_active("vol1"));
        assert!(guard.is_active("vol2"));
    }

    #[test]
    fn test_drop_releases() {
        let guard = UpgradeGuard::new();
        {
            let _lease = guard.acquire("vol1").unwrap();
            assert!(guard.is_active("vol1"));
        }
        assert!(!guard.is_active("vol1"));
        guard.acquire("vol1").unwrap();
    }
}
