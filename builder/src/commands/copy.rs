//! `COPY`: copy files from the build context into the root filesystem.

use std::io;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};
use filetime::FileTime;
use walkdir::WalkDir;

use super::{host_path, resolve_image_path, CacheState, Instruction};
use crate::archive::{FileSet, Materializer};
use crate::args::BuildArgs;
use crate::image::ImageConfig;
use crate::resolve::{normalize, resolve_if_symlink};

pub struct CopyCommand {
    sources: Vec<String>,
    dest: String,
    context: PathBuf,
    root: PathBuf,
    materializer: Materializer,
    cache: CacheState,
    snapshot_files: Vec<PathBuf>,
}

impl CopyCommand {
    pub fn new(
        sources: Vec<String>,
        dest: String,
        context: &Path,
        root: &Path,
        materializer: Materializer,
    ) -> Self {
        Self {
            sources,
            dest,
            context: context.to_path_buf(),
            root: root.to_path_buf(),
            materializer,
            cache: CacheState::new(),
            snapshot_files: Vec::new(),
        }
    }

    fn substituted(&self, config: &ImageConfig, args: &BuildArgs) -> Result<(Vec<String>, String)> {
        let sources = self
            .sources
            .iter()
            .map(|s| args.substitute(s, &config.env))
            .collect::<Result<Vec<_>>>()?;
        let dest = args.substitute(&self.dest, &config.env)?;
        Ok((sources, dest))
    }

    /// Locate `src` inside the build context.
    fn context_path(&self, src: &str) -> Result<PathBuf> {
        let context = normalize(&self.context);
        let path = normalize(&context.join(src.trim_start_matches('/')));
        if !path.starts_with(&context) {
            return Err(BuildError::Config(format!(
                "COPY source {} is outside the build context {}",
                src,
                self.context.display()
            )));
        }
        Ok(path)
    }

    fn copy_sources(&self, sources: &[String], dest: &str, workdir: &str) -> Result<FileSet> {
        let dest_is_dir = dest.ends_with('/') || sources.len() > 1;
        let image_dest = resolve_image_path(workdir, dest);
        let dest_path = host_path(&self.root, &image_dest);
        let mut written = FileSet::new();

        for src in sources {
            let src_path = self.context_path(src)?;
            let meta = std::fs::symlink_metadata(&src_path).map_err(|e| {
                BuildError::Io(io::Error::new(
                    e.kind(),
                    format!(
                        "COPY source not found: {} (in context {}): {}",
                        src,
                        self.context.display(),
                        e
                    ),
                ))
            })?;

            if meta.is_dir() {
                let target = resolve_if_symlink(&dest_path)?;
                copy_tree(&src_path, &target, &mut written)?;
            } else {
                let target = if dest_is_dir || dest_path.is_dir() {
                    match src_path.file_name() {
                        Some(name) => dest_path.join(name),
                        None => dest_path.clone(),
                    }
                } else {
                    dest_path.clone()
                };
                let target = resolve_if_symlink(&target)?;
                if dest_is_dir {
                    create_dir(&dest_path, &mut written)?;
                }
                copy_entry(&src_path, &target, &meta, &mut written)?;
            }
        }

        Ok(written)
    }
}

impl Instruction for CopyCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        if self.cache.is_cached() {
            let files = self.cache.replay(&self.materializer, &self.root)?;
            self.snapshot_files = files.into_vec();
            return Ok(());
        }

        let (sources, dest) = self.substituted(config, args)?;
        tracing::info!(sources = ?sources, dest = %dest, "Copying from build context");
        let written = self.copy_sources(&sources, &dest, config.working_dir())?;
        self.snapshot_files = written.into_vec();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("COPY {} {}", self.sources.join(" "), self.dest)
    }

    fn files_to_snapshot(&self) -> Vec<PathBuf> {
        self.snapshot_files.clone()
    }

    fn files_used_from_context(&self, config: &ImageConfig, args: &BuildArgs) -> Result<Vec<PathBuf>> {
        let (sources, _) = self.substituted(config, args)?;
        let mut files = Vec::new();
        for src in &sources {
            let path = self.context_path(src)?;
            if path.is_dir() {
                for entry in WalkDir::new(&path).follow_links(false).sort_by_file_name() {
                    let entry = entry.map_err(|e| {
                        BuildError::Config(format!(
                            "Failed to walk COPY source {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    files.push(entry.into_path());
                }
            } else {
                files.push(path);
            }
        }
        tracing::debug!(count = files.len(), "Using files from context");
        Ok(files)
    }

    fn resolved_text(&self, config: &ImageConfig, args: &BuildArgs) -> Result<String> {
        let (sources, dest) = self.substituted(config, args)?;
        Ok(format!(
            "COPY {} {}",
            sources.join(" "),
            resolve_image_path(config.working_dir(), &dest)
        ))
    }

    fn is_metadata_only(&self) -> bool {
        false
    }

    cache_state_accessors!();
}

fn create_dir(path: &Path, written: &mut FileSet) -> Result<()> {
    if !path.is_dir() {
        std::fs::create_dir_all(path).map_err(|e| {
            BuildError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create COPY destination {}: {}", path.display(), e),
            ))
        })?;
    }
    written.insert(path);
    Ok(())
}

/// Copy the contents of `src` (not `src` itself) into `dest`.
fn copy_tree(src: &Path, dest: &Path, written: &mut FileSet) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BuildError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to walk {}: {}", src.display(), e),
            ))
        })?;
        let relative = entry.path().strip_prefix(src).map_err(|e| {
            BuildError::Config(format!(
                "Failed to compute relative path for {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };
        let meta = std::fs::symlink_metadata(entry.path())?;
        copy_entry(entry.path(), &target, &meta, written)?;
    }
    Ok(())
}

/// Copy one file, directory or symlink, preserving mode and mtime.
fn copy_entry(src: &Path, target: &Path, meta: &std::fs::Metadata, written: &mut FileSet) -> Result<()> {
    let err = |e: io::Error| {
        BuildError::Io(io::Error::new(
            e.kind(),
            format!("Failed to copy {} to {}: {}", src.display(), target.display(), e),
        ))
    };

    if meta.is_dir() {
        if target.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
            std::fs::remove_file(target).map_err(err)?;
        }
        std::fs::create_dir_all(target).map_err(err)?;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(err)?;
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(err)?;
        }
        if let Ok(existing) = target.symlink_metadata() {
            if existing.is_dir() {
                std::fs::remove_dir_all(target).map_err(err)?;
            } else {
                std::fs::remove_file(target).map_err(err)?;
            }
        }

        if meta.file_type().is_symlink() {
            let link = std::fs::read_link(src).map_err(err)?;
            symlink(&link, target).map_err(err)?;
            written.insert(target);
            return Ok(());
        }

        std::fs::copy(src, target).map_err(err)?;
    }

    let mtime = FileTime::from_last_modification_time(meta);
    filetime::set_file_mtime(target, mtime).map_err(err)?;
    written.insert(target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{image_with_layers, tar_bytes};
    use super::*;
    use crate::archive::EntryMeta;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        context: TempDir,
        root: TempDir,
    }

    fn fixture() -> Fixture {
        let context = TempDir::new().unwrap();
        std::fs::write(context.path().join("foo"), "meow").unwrap();
        std::fs::create_dir_all(context.path().join("dir/sub")).unwrap();
        std::fs::write(context.path().join("dir/a.txt"), "a").unwrap();
        std::fs::write(context.path().join("dir/sub/b.txt"), "b").unwrap();
        Fixture {
            context,
            root: TempDir::new().unwrap(),
        }
    }

    fn copy(fx: &Fixture, sources: &[&str], dest: &str) -> CopyCommand {
        CopyCommand::new(
            sources.iter().map(|s| s.to_string()).collect(),
            dest.to_string(),
            fx.context.path(),
            fx.root.path(),
            Materializer::new(),
        )
    }

    fn run(cmd: &mut CopyCommand) -> Result<()> {
        cmd.execute(&mut ImageConfig::default(), &mut BuildArgs::new())
    }

    fn counting(counter: Arc<AtomicUsize>) -> Materializer {
        Materializer::with_extract_fn(Arc::new(
            move |_: &Path, _: &EntryMeta, _: &mut dyn Read| -> Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ))
    }

    #[test]
    fn test_copy_into_directory_dest() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["foo"], "tempCopyExecuteTest/");
        run(&mut cmd).unwrap();

        let dest = fx.root.path().join("tempCopyExecuteTest");
        assert!(dest.is_dir());
        assert_eq!(std::fs::read_to_string(dest.join("foo")).unwrap(), "meow");
        assert!(cmd.files_to_snapshot().contains(&dest.join("foo")));
    }

    #[test]
    fn test_copy_to_file_dest() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["foo"], "tempCopyExecuteTest");
        run(&mut cmd).unwrap();

        let dest = fx.root.path().join("tempCopyExecuteTest");
        assert!(dest.is_file());
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "meow");
    }

    #[test]
    fn test_copy_directory_contents() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["dir"], "/app");
        run(&mut cmd).unwrap();

        let app = fx.root.path().join("app");
        assert_eq!(std::fs::read_to_string(app.join("a.txt")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(app.join("sub/b.txt")).unwrap(), "b");
        assert!(!app.join("dir").exists());
    }

    #[test]
    fn test_copy_relative_to_workdir_with_args() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["$SRC"], "${DEST}/");
        let mut config = ImageConfig {
            working_dir: "/srv".to_string(),
            ..Default::default()
        };
        let mut args = BuildArgs::from_overrides(&["DEST=out".to_string()]).unwrap();
        args.declare("SRC", Some("foo".to_string())).unwrap();
        args.declare("DEST", None).unwrap();

        cmd.execute(&mut config, &mut args).unwrap();
        assert!(fx.root.path().join("srv/out/foo").is_file());
        assert_eq!(
            cmd.resolved_text(&config, &args).unwrap(),
            "COPY foo /srv/out/"
        );
    }

    #[test]
    fn test_copy_preserves_mode_and_mtime() {
        let fx = fixture();
        let src = fx.context.path().join("foo");
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o750)).unwrap();
        filetime::set_file_mtime(&src, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();

        let mut cmd = copy(&fx, &["foo"], "/bin/foo");
        run(&mut cmd).unwrap();

        let meta = std::fs::metadata(fx.root.path().join("bin/foo")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o750);
        assert_eq!(meta.mtime(), 1_500_000_000);
    }

    #[test]
    fn test_copy_through_symlinked_dest() {
        let fx = fixture();
        std::fs::create_dir(fx.root.path().join("real")).unwrap();
        symlink("real", fx.root.path().join("link")).unwrap();

        let mut cmd = copy(&fx, &["foo"], "/link/");
        run(&mut cmd).unwrap();
        assert!(fx.root.path().join("real/foo").is_file());
    }

    #[test]
    fn test_copy_rejects_escape_and_missing() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["../etc/passwd"], "/x");
        assert!(run(&mut cmd).is_err());

        let mut cmd = copy(&fx, &["missing"], "/x");
        assert!(run(&mut cmd).is_err());
    }

    #[test]
    fn test_files_used_from_context() {
        let fx = fixture();
        let cmd = copy(&fx, &["dir", "foo"], "/app/");
        let files = cmd
            .files_used_from_context(&ImageConfig::default(), &BuildArgs::new())
            .unwrap();
        let ctx = normalize(fx.context.path());
        assert!(files.contains(&ctx.join("dir")));
        assert!(files.contains(&ctx.join("dir/sub/b.txt")));
        assert!(files.contains(&ctx.join("foo")));
        assert_eq!(files.len(), 5);
    }

    #[test]
    fn test_undeclared_arg_fails_before_mutation() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["foo"], "/$NOPE/");
        assert!(run(&mut cmd).is_err());
        assert_eq!(std::fs::read_dir(fx.root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cached_with_single_layer() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut cmd = CopyCommand::new(
            vec!["foo".to_string()],
            "/".to_string(),
            fx.context.path(),
            fx.root.path(),
            counting(Arc::clone(&counter)),
        );
        cmd.mark_cached(true);
        cmd.attach_image(image_with_layers(vec![tar_bytes(&[("foo.txt", "meow")])]));

        run(&mut cmd).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cmd.layer().is_some());
        assert!(cmd.read_success());
        assert_eq!(cmd.files_to_snapshot(), vec![fx.root.path().join("foo.txt")]);
    }

    #[test]
    fn test_cached_replay_writes_files() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["foo"], "/");
        cmd.mark_cached(true);
        cmd.attach_image(image_with_layers(vec![tar_bytes(&[("etc/motd", "hi")])]));

        run(&mut cmd).unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.root.path().join("etc/motd")).unwrap(),
            "hi"
        );
    }

    #[test]
    fn test_cached_without_image() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["foo"], "/");
        cmd.mark_cached(true);

        let err = run(&mut cmd).unwrap_err();
        assert!(matches!(err, BuildError::CacheIntegrity(_)));
        assert!(cmd.layer().is_none());
        assert!(!cmd.read_success());
    }

    #[test]
    fn test_cached_with_wrong_layer_count() {
        let fx = fixture();
        for layers in [Vec::new(), vec![tar_bytes(&[("a", "1")]), tar_bytes(&[("b", "2")])]] {
            let counter = Arc::new(AtomicUsize::new(0));
            let mut cmd = CopyCommand::new(
                vec!["foo".to_string()],
                "/".to_string(),
                fx.context.path(),
                fx.root.path(),
                counting(Arc::clone(&counter)),
            );
            cmd.mark_cached(true);
            cmd.attach_image(image_with_layers(layers));

            let err = run(&mut cmd).unwrap_err();
            assert!(matches!(err, BuildError::CacheIntegrity(_)));
            assert_eq!(counter.load(Ordering::SeqCst), 0);
            assert!(cmd.layer().is_none());
            assert!(!cmd.read_success());
        }
    }

    #[test]
    fn test_cached_with_empty_layer_succeeds() {
        let fx = fixture();
        let mut cmd = copy(&fx, &["foo"], "/");
        cmd.mark_cached(true);
        cmd.attach_image(image_with_layers(vec![Vec::new()]));

        run(&mut cmd).unwrap();
        assert!(cmd.layer().is_some());
        assert!(cmd.read_success());
        assert!(cmd.files_to_snapshot().is_empty());
    }
}
