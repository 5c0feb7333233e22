//! Cache key computation.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};

use crate::image::sha256_file;

/// An ordered list of key components hashed into one fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeKey {
    keys: Vec<String>,
}

impl CompositeKey {
    /// Start a key chained onto the parent image's digest.
    pub fn new(parent_digest: &str) -> Self {
        Self {
            keys: vec![parent_digest.to_string()],
        }
    }

    pub fn add_key(&mut self, key: impl Into<String>) {
        self.keys.push(key.into());
    }

    /// Add build-context files, each as its context-relative path plus a
    /// content hash. Order of `files` does not matter.
    pub fn add_context_files(&mut self, context: &Path, files: &[PathBuf]) -> Result<()> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let relative = file.strip_prefix(context).unwrap_or(file);
            entries.push(format!("{}:{}", relative.display(), hash_path(file)?));
        }
        entries.sort();
        self.keys.extend(entries);
        Ok(())
    }

    /// The fingerprint: hex SHA-256 over the length-prefixed components.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for key in &self.keys {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Regular files hash by content, directories by mode, symlinks by target.
fn hash_path(path: &Path) -> Result<String> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| {
        BuildError::Config(format!(
            "Failed to stat context file {}: {}",
            path.display(),
            e
        ))
    })?;

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(path)?;
        Ok(format!("link:{}", target.display()))
    } else if meta.is_dir() {
        Ok(format!("dir:{:o}", meta.permissions().mode() & 0o7777))
    } else {
        Ok(format!(
            "file:{:o}:{}",
            meta.permissions().mode() & 0o7777,
            sha256_file(path)?
        ))
    }
}
