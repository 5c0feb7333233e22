//! Destination path resolution through a symlinked final component.

use std::io;
use std::path::{Component, Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};

/// Resolve `path` through at most one level of symlink indirection.
///
/// Walks up from `path` to the deepest component that exists. If that
/// component is a symlink, it is replaced by its target (relative targets
/// are taken relative to the link's directory) and the nonexistent suffix
/// is re-appended verbatim. Intermediate components are not canonicalized.
/// A path with no existing component is returned unchanged.
pub fn resolve_if_symlink(path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    let mut suffix: Vec<&std::ffi::OsStr> = Vec::new();

    loop {
        match std::fs::symlink_metadata(existing) {
            Ok(meta) => {
                if !meta.file_type().is_symlink() {
                    return Ok(path.to_path_buf());
                }
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                        suffix.push(name);
                        existing = parent;
                    }
                    _ => return Ok(path.to_path_buf()),
                }
            }
            Err(e) => {
                return Err(BuildError::DestinationResolution {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    let target = std::fs::read_link(existing).map_err(|e| BuildError::DestinationResolution {
        path: path.to_path_buf(),
        source: e,
    })?;
    let base = if target.is_absolute() {
        target
    } else {
        existing
            .parent()
            .map(|p| p.join(&target))
            .unwrap_or(target)
    };

    let mut resolved = normalize(&base);
    for part in suffix.iter().rev() {
        resolved.push(part);
    }

    if resolved != path {
        tracing::trace!(
            from = %path.display(),
            to = %resolved.display(),
            "Updating destination path due to symlink"
        );
    }
    Ok(resolved)
}

/// Lexically clean a path: drop `.`, fold `..` into the preceding part.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
