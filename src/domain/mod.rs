//! Domain layer - volume records, upgrade requests and port definitions
//!
//! The upgrade workflow talks to the volume registry and to the cluster only
//! through the traits defined here.

pub mod ports;

pub use ports::*;
