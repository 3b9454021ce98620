//! Shared utilities for db-ensure components
//!
//! This crate provides the ambient pieces every binary in the workspace needs:
//! - Structured logging initialization
//! - Environment variable parsing helpers

pub mod config;
pub mod logging;

pub use config::ConfigExt;
pub use logging::init_logging;
