//! Filesystem snapshotting.
//!
//! A snapshotter records the state of the root filesystem and, after an
//! instruction ran, packages what changed into an uncompressed tar layer.
//! Deleted paths are recorded as `.wh.` whiteout entries.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use a3s_build_core::config::SnapshotMode;
use a3s_build_core::error::{BuildError, Result};
use walkdir::WalkDir;

use crate::archive::{FileSet, WHITEOUT_PREFIX};

/// Produces layer tarballs from filesystem changes.
pub trait Snapshotter: Send {
    /// Record the current filesystem as the baseline.
    fn init(&mut self) -> Result<()>;

    /// Diff the whole tree against the baseline.
    ///
    /// Returns the tarball path, or `None` when nothing changed.
    fn take_snapshot_fs(&mut self) -> Result<Option<PathBuf>>;

    /// Package exactly the given paths (plus their ancestor directories).
    ///
    /// Returns the tarball path, or `None` when none of the paths exist.
    fn take_snapshot(&mut self, files: &[PathBuf]) -> Result<Option<PathBuf>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    File,
    Dir,
    Symlink,
    Special,
}

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
    mode: u32,
    uid: u32,
    gid: u32,
    kind: FileKind,
    link_target: Option<PathBuf>,
}

impl FileEntry {
    fn from_metadata(path: &Path, meta: &std::fs::Metadata) -> Option<Self> {
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            FileKind::Dir
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_file() {
            FileKind::File
        } else if file_type.is_socket() {
            return None;
        } else {
            FileKind::Special
        };

        Some(Self {
            size: meta.len(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            kind,
            link_target: if kind == FileKind::Symlink {
                std::fs::read_link(path).ok()
            } else {
                None
            },
        })
    }

    fn changed(&self, other: &FileEntry, mode: SnapshotMode) -> bool {
        let timing = self.size != other.size
            || self.mtime != other.mtime
            || self.mtime_nsec != other.mtime_nsec
            || self.kind != other.kind
            || self.link_target != other.link_target;
        match mode {
            SnapshotMode::Time => timing,
            SnapshotMode::Full => {
                timing || self.mode != other.mode || self.uid != other.uid || self.gid != other.gid
            }
        }
    }
}

/// Snapshotter that walks a directory tree.
#[derive(Debug)]
pub struct DirSnapshotter {
    root: PathBuf,
    work_dir: PathBuf,
    mode: SnapshotMode,
    /// Absolute paths never snapshotted
    ignored: Vec<PathBuf>,
    /// Root-relative path → entry
    baseline: BTreeMap<PathBuf, FileEntry>,
    layers_written: usize,
}

impl DirSnapshotter {
    /// Snapshot `root`, writing tarballs into `work_dir`.
    pub fn new(root: &Path, work_dir: &Path, mode: SnapshotMode) -> Self {
        Self {
            root: root.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            mode,
            ignored: vec![work_dir.to_path_buf()],
            baseline: BTreeMap::new(),
            layers_written: 0,
        }
    }

    /// Exclude a path from whole-tree snapshots. Relative paths are taken
    /// under the root. Paths passed to `take_snapshot` are always kept.
    pub fn ignore(&mut self, path: &Path) {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        if !self.ignored.contains(&path) {
            self.ignored.push(path);
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignored.iter().any(|i| path.starts_with(i))
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root)
            .ok()
            .filter(|r| !r.as_os_str().is_empty())
            .map(Path::to_path_buf)
    }

    /// Record every path under the root.
    fn capture(&self) -> Result<BTreeMap<PathBuf, FileEntry>> {
        let mut entries = BTreeMap::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !self.is_ignored(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Paths may vanish mid-walk
                Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                    continue
                }
                Err(e) => {
                    return Err(BuildError::Snapshot(format!(
                        "Failed to walk {}: {}",
                        self.root.display(),
                        e
                    )))
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let Some(relative) = self.relative(entry.path()) else {
                continue;
            };
            if let Some(file) = FileEntry::from_metadata(entry.path(), &meta) {
                entries.insert(relative, file);
            }
        }

        Ok(entries)
    }

    fn next_layer_path(&mut self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.work_dir).map_err(|e| {
            BuildError::Snapshot(format!(
                "Failed to create snapshot directory {}: {}",
                self.work_dir.display(),
                e
            ))
        })?;
        self.layers_written += 1;
        Ok(self
            .work_dir
            .join(format!("layer_{}.tar", self.layers_written)))
    }

    /// Write `paths` (root-relative, sorted) and whiteouts for `deleted`.
    fn write_layer(&mut self, paths: &[PathBuf], deleted: &[PathBuf]) -> Result<PathBuf> {
        let output = self.next_layer_path()?;
        let file = File::create(&output).map_err(|e| {
            BuildError::Snapshot(format!(
                "Failed to create layer file {}: {}",
                output.display(),
                e
            ))
        })?;

        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);

        for relative in deleted {
            let name = match relative.file_name() {
                Some(name) => name.to_string_lossy(),
                None => continue,
            };
            let whiteout = match relative.parent() {
                Some(parent) => parent.join(format!("{}{}", WHITEOUT_PREFIX, name)),
                None => PathBuf::from(format!("{}{}", WHITEOUT_PREFIX, name)),
            };
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_entry_type(tar::EntryType::Regular);
            builder
                .append_data(&mut header, &whiteout, io::empty())
                .map_err(|e| {
                    BuildError::Snapshot(format!(
                        "Failed to add whiteout {} to layer: {}",
                        whiteout.display(),
                        e
                    ))
                })?;
        }

        for relative in paths {
            let full = self.root.join(relative);
            builder
                .append_path_with_name(&full, relative)
                .map_err(|e| {
                    BuildError::Snapshot(format!(
                        "Failed to add {} to layer: {}",
                        relative.display(),
                        e
                    ))
                })?;
        }

        builder
            .finish()
            .map_err(|e| BuildError::Snapshot(format!("Failed to finalize layer: {}", e)))?;

        tracing::debug!(
            layer = %output.display(),
            files = paths.len(),
            whiteouts = deleted.len(),
            "Wrote snapshot layer"
        );
        Ok(output)
    }
}

impl Snapshotter for DirSnapshotter {
    fn init(&mut self) -> Result<()> {
        self.baseline = self.capture()?;
        tracing::debug!(
            root = %self.root.display(),
            entries = self.baseline.len(),
            "Initialized snapshot baseline"
        );
        Ok(())
    }

    fn take_snapshot_fs(&mut self) -> Result<Option<PathBuf>> {
        let current = self.capture()?;

        let changed: FileSet = current
            .iter()
            .filter(|(path, entry)| match self.baseline.get(*path) {
                None => true,
                Some(before) => before.changed(entry, self.mode),
            })
            .map(|(path, _)| path.clone())
            .collect();

        // Only the top-most deleted path needs a whiteout.
        let removed: Vec<&PathBuf> = self
            .baseline
            .keys()
            .filter(|path| !current.contains_key(*path))
            .collect();
        let deleted: Vec<PathBuf> = removed
            .iter()
            .filter(|path| {
                !path
                    .ancestors()
                    .skip(1)
                    .any(|a| !a.as_os_str().is_empty() && removed.iter().any(|r| r.as_path() == a))
            })
            .map(|p| (*p).clone())
            .collect();

        if changed.is_empty() && deleted.is_empty() {
            self.baseline = current;
            tracing::debug!("No filesystem changes detected");
            return Ok(None);
        }

        let paths: Vec<PathBuf> = changed
            .with_ancestors()
            .into_iter()
            .filter(|p| current.contains_key(p))
            .collect();

        let layer = self.write_layer(&paths, &deleted)?;
        self.baseline = current;
        Ok(Some(layer))
    }

    fn take_snapshot(&mut self, files: &[PathBuf]) -> Result<Option<PathBuf>> {
        let requested: FileSet = files.iter().cloned().collect();
        let paths: Vec<PathBuf> = requested
            .with_ancestors()
            .iter()
            .filter(|p| p.symlink_metadata().is_ok())
            .filter_map(|p| self.relative(p))
            .collect();

        let layer = if paths.is_empty() {
            None
        } else {
            Some(self.write_layer(&paths, &[])?)
        };

        self.baseline = self.capture()?;
        Ok(layer)
    }
}
