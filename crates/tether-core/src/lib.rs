//! Tether Core Library
//!
//! Shared functionality for Tether components:
//! - Configuration resolution and hierarchy (git + sync tunables)
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, GitConfig, PullStrategy, SyncConfig};
pub use error::{Error, Result};
