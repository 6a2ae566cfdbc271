//! PV Upgrade Operator
//!
//! Upgrades Kubernetes PersistentVolumes that embed a legacy NFS or iSCSI
//! source into CSI PersistentVolumes served by a storage driver, in place
//! and without touching the data on the backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                 CLI (one-shot upgrade)  /  REST API (serve)                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          PvUpgrader (orchestrator)                           │
//! │  ┌───────────────┐  ┌─────────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │  Validation   │  │ Resource State  │  │  Descriptor  │  │ Guard/Metrics│  │
//! │  │  (preconds)   │  │    Waiters      │  │  Converter   │  │              │  │
//! │  └───────┬───────┘  └────────┬────────┘  └──────────────┘  └──────────────┘  │
//! │          │                   │ Backoff Poller                                │
//! ├──────────┴───────────────────┴──────────────────────────────────────────────┤
//! │  VolumeRegistry port             │  ClusterGateway port                      │
//! │  ┌────────────┐ ┌─────────────┐  │  ┌──────────────────┐ ┌───────────────┐  │
//! │  │    HTTP    │ │   Memory    │  │  │ Kube (reflectors)│ │    Memory     │  │
//! │  └────────────┘ └─────────────┘  │  └──────────────────┘ └───────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`upgrade`]: The upgrade workflow and its building blocks
//! - [`gateway`]: Cluster access adapters
//! - [`registry`]: Volume registry adapters
//! - [`api`]: REST frontend
//! - [`domain`]: Core domain types and ports
//! - [`error`]: Error types and handling

pub mod api;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod upgrade;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use domain::ports::{
    ClusterGateway, ClusterGatewayRef, MigrationType, UpgradeVolumeRequest, VolumeProtocol,
    VolumeRecord, VolumeRegistry, VolumeRegistryRef, VolumeState,
};

pub use error::{Error, PreconditionError, Result};

pub use gateway::{KubeGateway, KubeGatewayConfig, MemoryGateway, Mutation, SimulatedControllers};

pub use registry::{HttpRegistryConfig, HttpVolumeRegistry, MemoryVolumeRegistry};

pub use upgrade::{
    BackoffConfig, ClaimPhase, PvUpgrader, ResourceWaiter, UpgradeConfig, UpgradeGuard,
    UpgradeMetrics, UpgradePhase,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
