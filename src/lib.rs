//! VRE-RUNNER — launcher for the VRE risk engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod device;
pub mod engine;
pub mod patch;
