//! Build configuration.
//!
//! `BuildOptions` is handed to the build engine by whatever front end
//! acquired the build context and parsed the instructions.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Options for a single image build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Build context directory (source of COPY files)
    pub context_dir: PathBuf,

    /// Root of the filesystem the instructions mutate
    pub root_dir: PathBuf,

    /// Scratch directory for snapshot tarballs (temp dir when unset)
    pub work_dir: Option<PathBuf>,

    /// Build argument overrides (`KEY=VALUE`)
    pub build_args: Vec<String>,

    /// Layer cache settings
    pub cache: CacheOptions,

    /// Write an OCI image layout here when set
    pub output_dir: Option<PathBuf>,

    /// Image reference recorded in the OCI index
    pub reference: String,

    /// How the snapshotter detects modified files
    pub snapshot_mode: SnapshotMode,

    /// Root-relative paths never included in snapshots
    pub ignore_paths: Vec<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            context_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            root_dir: PathBuf::from("/"),
            work_dir: None,
            build_args: Vec::new(),
            cache: CacheOptions::default(),
            output_dir: None,
            reference: "a3s-build:latest".to_string(),
            snapshot_mode: SnapshotMode::Full,
            ignore_paths: default_ignore_paths(),
        }
    }
}

impl BuildOptions {
    /// Load options from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read build options {}: {}",
                path.display(),
                e
            ))
        })?;

        let options: BuildOptions = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        options.validate()?;
        Ok(options)
    }

    /// Check that the options describe a usable build.
    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.is_absolute() {
            return Err(BuildError::Config(format!(
                "root_dir must be absolute, got {}",
                self.root_dir.display()
            )));
        }
        if !self.context_dir.is_dir() {
            return Err(BuildError::Config(format!(
                "Build context {} is not a directory",
                self.context_dir.display()
            )));
        }
        if let Some(ref dir) = self.cache.dir {
            if !dir.is_absolute() {
                return Err(BuildError::Config(format!(
                    "cache.dir must be absolute, got {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Whether the build mutates the host root directly.
    pub fn is_host_root(&self) -> bool {
        self.root_dir == Path::new("/")
    }
}

/// Layer cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Look up and push layers
    pub enabled: bool,

    /// Cache directory (platform cache dir when unset)
    pub dir: Option<PathBuf>,

    /// Entries older than this are treated as missing
    pub ttl_hours: u64,

    /// Prune the cache to this size after a build (0 = unlimited)
    pub max_size_bytes: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            ttl_hours: 24 * 14,
            max_size_bytes: 0,
        }
    }
}

impl CacheOptions {
    /// Directory holding cached layers.
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        match self.dir {
            Some(ref dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|d| d.join("a3s-build").join("layers"))
                .ok_or_else(|| {
                    BuildError::Config("Cannot determine cache directory".to_string())
                }),
        }
    }
}

/// File change detection strategy for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotMode {
    /// Compare size, mtime, mode and ownership
    Full,
    /// Compare size and mtime only
    Time,
}

impl std::fmt::Display for SnapshotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Time => write!(f, "time"),
        }
    }
}

impl std::str::FromStr for SnapshotMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "time" => Ok(Self::Time),
            _ => Err(format!("unknown snapshot mode: '{}' (supported: full, time)", s)),
        }
    }
}

/// Kernel-backed trees and runtime sockets; never image content.
fn default_ignore_paths() -> Vec<PathBuf> {
    ["proc", "sys", "dev", "var/run"]
        .iter()
        .map(PathBuf::from)
        .collect()
}
