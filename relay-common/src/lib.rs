//! Shared types, utilities, and configuration for the message router
//! workspace.
//!
//! This crate provides:
//! - Configuration types and loading (`config`)
//! - Error types and handling utilities (`error`)
//! - Logging setup and structured logging helpers (`logging`)
//! - Utility functions used across every crate (`util`)

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;

pub use config::AppConfig;
pub use error::{Error, Result, ResultExt};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
