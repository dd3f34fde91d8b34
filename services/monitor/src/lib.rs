//! Monitor service library crate.
//!
//! # Purpose
//! Exposes the monitor subsystems (config, observability, sinks, cluster sweep)
//! for use by the monitor binary and integration tests.
pub mod config;
pub mod observability;
pub mod sinks;
pub mod sweep;
