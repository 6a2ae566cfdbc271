//! Volume Registry Adapters
//!
//! Provides adapters for the [`VolumeRegistry`](crate::domain::ports::VolumeRegistry) port:
//! - Http: the registry's REST API
//! - Memory: a static set of records, optionally loaded from YAML

pub mod http;
pub mod memory;

pub use http::*;
pub use memory::*;

/// Kind name used in not-found errors for registry lookups
pub const KIND_VOLUME: &str = "Volume";
