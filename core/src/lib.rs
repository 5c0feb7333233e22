//! A3S Build Core - Foundational Types
//!
//! Error types and build configuration shared by the A3S image builder.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BuildOptions, CacheOptions, SnapshotMode};
pub use error::{BuildError, Result};

/// A3S Build version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
