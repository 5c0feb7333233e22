//! Tar stream materialization.
//!
//! Replays a layer's tar stream onto a destination root one entry at a time,
//! reproducing ownership, permissions and timestamps. The per-entry write is
//! a strategy (`ExtractFn`) chosen at construction, so tests can count
//! entries without touching the filesystem.

use std::collections::{BTreeSet, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use filetime::FileTime;
use tar::{Archive, EntryType};

/// Symlinks followed while resolving one entry before giving up (ELOOP).
const MAX_SYMLINK_HOPS: usize = 40;

/// Prefix marking a deleted path in a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker whose presence hides a directory's lower contents.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Kind of a tar entry, reduced to what the materializer reproduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    HardLink,
    Symlink,
    /// Devices, FIFOs and anything else
    Other,
}

/// Decoded header of one tar entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Entry name relative to the archive root, normalized
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits including setuid/setgid/sticky
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time, seconds since epoch
    pub mtime: i64,
    /// Access time when the header records one (GNU headers)
    pub atime: Option<i64>,
    /// Target of a hard link or symlink, verbatim
    pub link_name: Option<PathBuf>,
}

impl EntryMeta {
    fn from_entry<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Self> {
        let header = entry.header();
        let raw_path = entry
            .path()
            .map_err(|e| BuildError::extraction("<tar>", format!("invalid entry path: {}", e)))?;
        let path = normalize_entry_path(&raw_path)?;

        let kind = match header.entry_type() {
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Link => EntryKind::HardLink,
            EntryType::Symlink => EntryKind::Symlink,
            _ => EntryKind::Other,
        };

        let field = |name: &str, r: io::Result<u64>| {
            r.map_err(|e| BuildError::extraction(&path, format!("invalid {} in header: {}", name, e)))
        };
        let mode = field("mode", header.mode().map(u64::from))? as u32;
        let uid = field("uid", header.uid())? as u32;
        let gid = field("gid", header.gid())? as u32;
        let mtime = field("mtime", header.mtime())? as i64;
        let atime = header
            .as_gnu()
            .and_then(|gnu| gnu.atime().ok())
            .filter(|t| *t > 0)
            .map(|t| t as i64);

        let link_name = entry
            .link_name()
            .map_err(|e| BuildError::extraction(&path, format!("invalid link name: {}", e)))?
            .map(|l| l.into_owned());

        Ok(Self {
            path,
            kind,
            mode: mode & 0o7777,
            uid,
            gid,
            mtime,
            atime,
            link_name,
        })
    }
}

/// Per-entry write strategy: `(destination root, header, body)`.
pub type ExtractFn = Arc<dyn Fn(&Path, &EntryMeta, &mut dyn Read) -> Result<()> + Send + Sync>;

/// Replays tar streams onto a destination root.
#[derive(Clone)]
pub struct Materializer {
    extract: ExtractFn,
}

impl Materializer {
    /// A materializer that writes entries to the filesystem.
    pub fn new() -> Self {
        Self::with_extract_fn(Arc::new(extract_entry))
    }

    /// A materializer using a custom per-entry strategy.
    pub fn with_extract_fn(extract: ExtractFn) -> Self {
        Self { extract }
    }

    /// Replay every entry of `reader` onto `dest`.
    ///
    /// Returns the concrete paths written. Whiteout entries are applied
    /// directly and never reach the per-entry strategy.
    pub fn materialize<R: Read>(&self, reader: R, dest: &Path) -> Result<FileSet> {
        let mut archive = Archive::new(reader);
        let mut written = FileSet::new();

        let entries = archive
            .entries()
            .map_err(|e| BuildError::extraction(dest, format!("failed to read tar stream: {}", e)))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| {
                BuildError::extraction(dest, format!("failed to read tar entry: {}", e))
            })?;
            let meta = EntryMeta::from_entry(&entry)?;

            if apply_whiteout(dest, &meta.path)? {
                continue;
            }

            let target = resolve_in_root(dest, &meta.path)?;
            (self.extract)(dest, &meta, &mut entry)?;

            if meta.kind != EntryKind::Other {
                written.insert(target);
            }
        }

        tracing::debug!(
            dest = %dest.display(),
            files = written.len(),
            "Materialized tar stream"
        );

        Ok(written)
    }
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Materializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materializer").finish_non_exhaustive()
    }
}

/// Write one tar entry under `dest`.
///
/// Symlinks among the entry's parent directories are followed as if `dest`
/// were the filesystem root; an entry that would land outside `dest` fails.
pub fn extract_entry(dest: &Path, meta: &EntryMeta, body: &mut dyn Read) -> Result<()> {
    let path = resolve_in_root(dest, &meta.path)?;
    let err = |e: io::Error| BuildError::extraction(&path, e);

    match meta.kind {
        EntryKind::Regular => {
            tracing::trace!(path = %path.display(), "Creating file");
            if let Some(dir) = path.parent() {
                // Entries are not guaranteed to arrive parent-first, and a
                // file may earlier have been written where a directory now goes.
                ensure_dir(dir).map_err(err)?;
            }
            remove_non_dir(&path).map_err(err)?;

            let mut file = fs::File::create(&path).map_err(err)?;
            io::copy(body, &mut file).map_err(err)?;
            drop(file);

            set_permissions(&path, meta.mode, meta.uid, meta.gid).map_err(err)?;
            let mtime = FileTime::from_unix_time(meta.mtime, 0);
            let atime = meta
                .atime
                .map(|t| FileTime::from_unix_time(t, 0))
                .unwrap_or(mtime);
            filetime::set_file_times(&path, atime, mtime).map_err(err)?;
        }

        EntryKind::Directory => {
            tracing::trace!(path = %path.display(), "Creating directory");
            mkdir_all_with_permissions(&path, meta.mode, meta.uid, meta.gid).map_err(err)?;
        }

        EntryKind::HardLink => {
            let link_name = meta
                .link_name
                .as_ref()
                .ok_or_else(|| BuildError::extraction(&path, "hard link without target"))?;
            let target = resolve_in_root(dest, &normalize_entry_path(link_name)?)?;
            tracing::trace!(target = %target.display(), path = %path.display(), "Creating hard link");

            if let Some(dir) = path.parent() {
                ensure_dir(dir).map_err(err)?;
            }
            if fs::symlink_metadata(&target).is_err() {
                return Err(BuildError::extraction(
                    &path,
                    format!(
                        "hard link target {} has not been materialized",
                        target.display()
                    ),
                ));
            }
            remove_non_dir(&path).map_err(err)?;
            fs::hard_link(&target, &path).map_err(err)?;
        }

        EntryKind::Symlink => {
            let link_name = meta
                .link_name
                .as_ref()
                .ok_or_else(|| BuildError::extraction(&path, "symlink without target"))?;
            tracing::trace!(target = %link_name.display(), path = %path.display(), "Creating symlink");

            if let Some(dir) = path.parent() {
                ensure_dir(dir).map_err(err)?;
            }
            remove_non_dir(&path).map_err(err)?;
            std::os::unix::fs::symlink(link_name, &path).map_err(err)?;
            std::os::unix::fs::lchown(&path, Some(meta.uid), Some(meta.gid)).map_err(err)?;
        }

        EntryKind::Other => {
            tracing::debug!(path = %path.display(), "Skipping unsupported tar entry type");
        }
    }

    Ok(())
}

/// Create `path` and its parents, then apply ownership and mode.
///
/// Mode is applied after chown because chown clears setuid/setgid bits,
/// and again explicitly because `create_dir_all` leaves existing
/// directories untouched and is subject to the umask.
pub fn mkdir_all_with_permissions(path: &Path, mode: u32, uid: u32, gid: u32) -> io::Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if !meta.is_dir() {
            fs::remove_file(path)?;
        }
    }
    fs::create_dir_all(path)?;
    set_permissions(path, mode, uid, gid)
}

/// Apply ownership, then mode.
pub fn set_permissions(path: &Path, mode: u32, uid: u32, gid: u32) -> io::Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Make sure `dir` exists as a directory, replacing a non-directory.
///
/// `dir` must already be resolved with [`resolve_in_root`], so a symlink
/// found here is replaced rather than followed.
fn ensure_dir(dir: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            fs::remove_file(dir)?;
            fs::create_dir_all(dir)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dir),
        Err(e) => Err(e),
    }
}

/// Remove whatever non-directory currently occupies `path`.
fn remove_non_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path),
        _ => Ok(()),
    }
}

/// Apply a whiteout entry. Returns false for ordinary entries.
fn apply_whiteout(dest: &Path, entry: &Path) -> Result<bool> {
    let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };
    let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) else {
        return Ok(false);
    };
    let resolved = resolve_in_root(dest, entry)?;
    let parent = resolved.parent().unwrap_or(dest).to_path_buf();
    let err = |p: &Path, e: io::Error| BuildError::extraction(p, e);

    if name == OPAQUE_WHITEOUT {
        tracing::trace!(dir = %parent.display(), "Applying opaque whiteout");
        if let Ok(read_dir) = fs::read_dir(&parent) {
            for child in read_dir {
                let child = child.map_err(|e| err(&parent, e))?.path();
                remove_any(&child).map_err(|e| err(&child, e))?;
            }
        }
        return Ok(true);
    }

    let target = parent.join(hidden);
    tracing::trace!(path = %target.display(), "Applying whiteout");
    remove_any(&target).map_err(|e| err(&target, e))?;
    Ok(true)
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Normalize an entry name lexically, rejecting escapes above the root.
fn normalize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(BuildError::extraction(
                        path,
                        "entry escapes the destination root",
                    ));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

enum Step {
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> impl Iterator<Item = Step> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(part) => Some(Step::Name(part.to_os_string())),
        Component::ParentDir => Some(Step::Parent),
        Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
    })
}

/// Host path of the normalized entry `entry` under `dest`, following
/// symlinked parent directories inside `dest`.
///
/// Absolute link targets are taken relative to `dest`. The final component
/// is not followed. Fails when resolution climbs above `dest` or loops.
pub fn resolve_in_root(dest: &Path, entry: &Path) -> Result<PathBuf> {
    let mut parts: VecDeque<Step> = steps(entry).collect();
    let Some(Step::Name(last)) = parts.pop_back() else {
        return Ok(dest.join(entry));
    };

    let escape = || BuildError::extraction(dest.join(entry), "entry escapes the destination root");
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(step) = parts.pop_front() {
        let name = match step {
            Step::Parent => {
                if !resolved.pop() {
                    return Err(escape());
                }
                continue;
            }
            Step::Name(name) => name,
        };

        let candidate = resolved.join(&name);
        let host = dest.join(&candidate);
        match fs::symlink_metadata(&host) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(BuildError::extraction(&host, "too many levels of symbolic links"));
                }
                let target = fs::read_link(&host).map_err(|e| BuildError::extraction(&host, e))?;
                if target.is_absolute() {
                    resolved.clear();
                }
                for step in steps(&target).collect::<Vec<_>>().into_iter().rev() {
                    parts.push_front(step);
                }
            }
            _ => resolved = candidate,
        }
    }

    Ok(dest.join(resolved).join(last))
}

/// A set of concrete filesystem paths touched by an instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    paths: BTreeSet<PathBuf>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths in sorted order; parents sort before their children.
    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.paths.iter()
    }

    /// Merge another set into this one.
    pub fn extend(&mut self, other: FileSet) {
        self.paths.extend(other.paths);
    }

    /// Expand to include every ancestor directory of every member.
    pub fn with_ancestors(&self) -> FileSet {
        let mut paths = BTreeSet::new();
        for path in &self.paths {
            for ancestor in path.ancestors() {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                paths.insert(ancestor.to_path_buf());
            }
        }
        FileSet { paths }
    }

    pub fn into_vec(self) -> Vec<PathBuf> {
        self.paths.into_iter().collect()
    }
}

impl FromIterator<PathBuf> for FileSet {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FileSet {
    type Item = PathBuf;
    type IntoIter = std::collections::btree_set::IntoIter<PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.into_iter()
    }
}
