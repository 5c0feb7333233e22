//! `WORKDIR`: set the working directory, creating it in the root.

use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result};

use super::{host_path, resolve_image_path, CacheState, Instruction};
use crate::args::BuildArgs;
use crate::image::ImageConfig;
use crate::resolve::normalize;

pub struct WorkdirCommand {
    path: String,
    root: PathBuf,
    cache: CacheState,
    snapshot_files: Vec<PathBuf>,
}

impl WorkdirCommand {
    pub fn new(path: String, root: &Path) -> Self {
        Self {
            path,
            root: root.to_path_buf(),
            cache: CacheState::new(),
            snapshot_files: Vec::new(),
        }
    }

    fn resolve(&self, config: &ImageConfig, args: &BuildArgs) -> Result<String> {
        let path = args.substitute(&self.path, &config.env)?;
        let joined = resolve_image_path(config.working_dir(), &path);
        Ok(normalize(Path::new(&joined)).display().to_string())
    }
}

impl Instruction for WorkdirCommand {
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        let workdir = self.resolve(config, args)?;
        let host = host_path(&self.root, &workdir);

        self.snapshot_files.clear();
        if !host.exists() {
            tracing::debug!(workdir = %workdir, "Creating working directory");
            std::fs::create_dir_all(&host).map_err(|e| {
                BuildError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create WORKDIR {}: {}", host.display(), e),
                ))
            })?;
            self.snapshot_files.push(host);
        }

        config.working_dir = workdir;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("WORKDIR {}", self.path)
    }

    fn files_to_snapshot(&self) -> Vec<PathBuf> {
        self.snapshot_files.clone()
    }

    fn resolved_text(&self, config: &ImageConfig, args: &BuildArgs) -> Result<String> {
        Ok(format!("WORKDIR {}", self.resolve(config, args)?))
    }

    fn is_metadata_only(&self) -> bool {
        false
    }

    fn should_cache_output(&self) -> bool {
        false
    }

    cache_state_accessors!();
}
