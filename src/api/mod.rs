//! API Module
//!
//! REST frontend for the upgrade workflow.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
