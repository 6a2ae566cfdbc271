//! Cluster Gateway Adapters
//!
//! Provides adapters for the [`ClusterGateway`](crate::domain::ports::ClusterGateway) port:
//! - Kube: a live cluster, with watch-fed stores for PVs and PVCs
//! - Memory: an in-process cluster that simulates the PV controller

pub mod kubernetes;
pub mod memory;
pub mod patch;

pub use kubernetes::*;
pub use memory::*;

use crate::error::{Error, Result};
use kube::{Resource, ResourceExt};

pub const KIND_PV: &str = "PersistentVolume";
pub const KIND_PVC: &str = "PersistentVolumeClaim";
pub const KIND_POD: &str = "Pod";

/// "namespace/name" form used in logs and errors
pub fn display_name(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Check that an object pulled out of a store really is the one stored under `key`.
///
/// A mismatch means the store is corrupted; callers treat it as fatal.
pub fn verify_cached<K>(kind: &str, key: &str, object: K) -> Result<K>
where
    K: Resource,
{
    let found = match object.namespace() {
        Some(ns) => display_name(&ns, &object.name_any()),
        None => object.name_any(),
    };

    if found != key {
        return Err(Error::CacheCorruption {
            kind: kind.to_string(),
            key: key.to_string(),
            found,
        });
    }

    Ok(object)
}
