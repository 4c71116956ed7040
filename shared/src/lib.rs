//! Shared types and utilities for iotedge
//!
//! This crate contains the JSON wire types spoken by field devices, the HTTP
//! route table, and timestamp helpers used by both the server and the CLI.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{device::*, logging::*, series::*};
