//! Shared utilities for the etcd fleet supervisor
//!
//! This crate provides common functionality used across the supervisor binary:
//! - Structured logging initialization
//! - Environment variable parsing helpers
//! - Command execution utilities

pub mod command;
pub mod config;
pub mod logging;

pub use command::{run, run_checked};
pub use config::ConfigExt;
pub use logging::init_logging;
