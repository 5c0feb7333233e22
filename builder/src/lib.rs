//! A3S Build - daemonless container image builder.
//!
//! Executes parsed build instructions directly against a root filesystem,
//! snapshots each instruction's effects into a layer, and reuses layers
//! from a content-addressed cache when an instruction's fingerprint matches
//! a previous build.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod args;
pub mod cache;
pub mod commands;
pub mod executor;
pub mod image;
pub mod key;
pub mod layout;
pub mod resolve;
pub mod snapshot;

// Re-export common types
pub use a3s_build_core::{BuildError, BuildOptions, CacheOptions, Result, SnapshotMode};
pub use archive::{EntryKind, EntryMeta, ExtractFn, FileSet, Materializer};
pub use args::BuildArgs;
pub use cache::{LayerCache, LayerMeta, LocalLayerCache, MemoryLayerCache};
pub use commands::{CacheState, CommandBuilder, Directive, Instruction};
pub use executor::{BuildResult, Builder};
pub use image::{FileLayer, Image, ImageConfig, Layer, LayeredImage, MemoryLayer};
pub use key::CompositeKey;
pub use layout::{write_layout, HistoryEntry};
pub use resolve::resolve_if_symlink;
pub use snapshot::{DirSnapshotter, Snapshotter};

/// A3S Build version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
