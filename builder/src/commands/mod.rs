//! Build instructions.
//!
//! Every instruction implements [`Instruction`], the capability set the
//! driver relies on: execute, describe, report context inputs and touched
//! paths, and carry a [`CacheState`] for replaying a cached layer instead of
//! running for real.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_build_core::config::BuildOptions;
use a3s_build_core::error::{BuildError, Result};

use crate::archive::{FileSet, Materializer};
use crate::args::BuildArgs;
use crate::image::{Image, ImageConfig, Layer};

/// Implements the `cache_state` accessors for a struct with a `cache` field.
macro_rules! cache_state_accessors {
    () => {
        fn cache_state(&self) -> &$crate::commands::CacheState {
            &self.cache
        }

        fn cache_state_mut(&mut self) -> &mut $crate::commands::CacheState {
            &mut self.cache
        }
    };
}

mod arg;
mod copy;
mod metadata;
mod run;
pub mod user;
mod workdir;

pub use arg::ArgCommand;
pub use copy::CopyCommand;
pub use metadata::{
    CmdCommand, EntrypointCommand, EnvCommand, ExposeCommand, LabelCommand, UserCommand,
};
pub use run::RunCommand;
pub use user::{add_default_home, RootUsers, SystemUsers, UserInfo, UserLookup};
pub use workdir::WorkdirCommand;

/// One build step.
pub trait Instruction: Send {
    /// Apply the instruction to the image config and, unless it only
    /// touches metadata, to the root filesystem.
    fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()>;

    /// Human-readable form, used for logs and error attribution.
    fn describe(&self) -> String;

    /// Paths touched by the last `execute`. Empty means no scoped snapshot.
    fn files_to_snapshot(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Build-context files whose content determines this step's output.
    fn files_used_from_context(
        &self,
        _config: &ImageConfig,
        _args: &BuildArgs,
    ) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    /// Instruction text after substitution, as hashed into the cache key.
    fn resolved_text(&self, _config: &ImageConfig, _args: &BuildArgs) -> Result<String> {
        Ok(self.describe())
    }

    fn is_metadata_only(&self) -> bool {
        true
    }

    fn requires_unpacked_fs(&self) -> bool {
        false
    }

    fn should_cache_output(&self) -> bool {
        true
    }

    fn cache_state(&self) -> &CacheState;

    fn cache_state_mut(&mut self) -> &mut CacheState;

    fn mark_cached(&mut self, cached: bool) {
        self.cache_state_mut().mark_cached(cached);
    }

    fn attach_image(&mut self, image: Arc<dyn Image>) {
        self.cache_state_mut().attach_image(image);
    }

    fn layer(&self) -> Option<Arc<dyn Layer>> {
        self.cache_state().layer()
    }

    fn read_success(&self) -> bool {
        self.cache_state().read_success()
    }
}

/// Per-instruction cache bookkeeping.
///
/// A layer is attached only after `resolve` has checked that the image
/// holds exactly one layer.
#[derive(Default)]
pub struct CacheState {
    cached: bool,
    image: Option<Arc<dyn Image>>,
    layer: Option<Arc<dyn Layer>>,
    read_success: bool,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn mark_cached(&mut self, cached: bool) {
        self.cached = cached;
        if !cached {
            self.image = None;
            self.layer = None;
            self.read_success = false;
        }
    }

    /// Attach the image holding this instruction's cached output.
    pub fn attach_image(&mut self, image: Arc<dyn Image>) {
        let same = self
            .image
            .as_ref()
            .map(|current| Arc::ptr_eq(current, &image))
            .unwrap_or(false);
        if !same {
            self.layer = None;
            self.read_success = false;
        }
        self.image = Some(image);
    }

    /// Resolve the attached image to its single layer.
    ///
    /// Repeating the call with the same image returns the same layer.
    pub fn resolve(&mut self) -> Result<Arc<dyn Layer>> {
        if let Some(ref layer) = self.layer {
            return Ok(Arc::clone(layer));
        }

        let image = self
            .image
            .as_ref()
            .ok_or_else(|| BuildError::CacheIntegrity("command image is nil".to_string()))?;

        let mut layers = image.layers()?;
        if layers.len() != 1 {
            return Err(BuildError::CacheIntegrity(format!(
                "expected 1 layers but got {}",
                layers.len()
            )));
        }

        let layer = layers.remove(0);
        tracing::info!(digest = %layer.digest(), "Found cached layer, extracting to filesystem");
        self.cached = true;
        self.layer = Some(Arc::clone(&layer));
        Ok(layer)
    }

    pub fn layer(&self) -> Option<Arc<dyn Layer>> {
        self.layer.clone()
    }

    pub fn read_success(&self) -> bool {
        self.read_success
    }

    /// Replay the cached layer onto `root`, returning the paths written.
    pub fn replay(&mut self, materializer: &Materializer, root: &Path) -> Result<FileSet> {
        let layer = self.resolve()?;
        let reader = layer.uncompressed()?;
        let files = materializer.materialize(reader, root)?;
        self.read_success = true;
        Ok(files)
    }
}

impl fmt::Debug for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheState")
            .field("cached", &self.cached)
            .field("has_image", &self.image.is_some())
            .field("layer", &self.layer.as_ref().map(|l| l.digest().to_string()))
            .field("read_success", &self.read_success)
            .finish()
    }
}

/// A parsed build instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `COPY <src>... <dest>`
    Copy { sources: Vec<String>, dest: String },
    /// `RUN <command>` (shell form)
    Run { command: String },
    /// `ENV <key>=<value> ...`
    Env { pairs: Vec<(String, String)> },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `CMD ["exec", "form"]`
    Cmd { exec: Vec<String> },
    /// `ENTRYPOINT ["exec", "form"]`
    Entrypoint { exec: Vec<String> },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `LABEL <key>=<value> ...`
    Label { pairs: Vec<(String, String)> },
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<String> },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Copy { sources, dest } => write!(f, "COPY {} {}", sources.join(" "), dest),
            Directive::Run { command } => write!(f, "RUN {}", command),
            Directive::Env { pairs } => write!(f, "ENV {}", join_pairs(pairs)),
            Directive::Workdir { path } => write!(f, "WORKDIR {}", path),
            Directive::Cmd { exec } => write!(f, "CMD {:?}", exec),
            Directive::Entrypoint { exec } => write!(f, "ENTRYPOINT {:?}", exec),
            Directive::User { user } => write!(f, "USER {}", user),
            Directive::Label { pairs } => write!(f, "LABEL {}", join_pairs(pairs)),
            Directive::Expose { ports } => write!(f, "EXPOSE {}", ports.join(" ")),
            Directive::Arg { name, default } => match default {
                Some(d) => write!(f, "ARG {}={}", name, d),
                None => write!(f, "ARG {}", name),
            },
        }
    }
}

pub(crate) fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accounts of the build root: the host database when building on `/`,
/// otherwise the root's own `etc/passwd` and `etc/group`.
fn default_users(options: &BuildOptions) -> Arc<dyn UserLookup> {
    if options.is_host_root() {
        Arc::new(SystemUsers)
    } else {
        Arc::new(RootUsers::new(&options.root_dir))
    }
}

/// Turns parsed directives into executable instructions bound to one build.
#[derive(Clone)]
pub struct CommandBuilder {
    context: PathBuf,
    root: PathBuf,
    materializer: Materializer,
    users: Arc<dyn UserLookup>,
}

impl CommandBuilder {
    pub fn new(options: &BuildOptions) -> Self {
        Self {
            context: options.context_dir.clone(),
            root: options.root_dir.clone(),
            materializer: Materializer::new(),
            users: default_users(options),
        }
    }

    /// Use a custom materializer for cached-layer replay.
    pub fn with_materializer(mut self, materializer: Materializer) -> Self {
        self.materializer = materializer;
        self
    }

    /// Use a custom account database for `USER` and HOME resolution.
    pub fn with_user_lookup(mut self, users: Arc<dyn UserLookup>) -> Self {
        self.users = users;
        self
    }

    pub fn instruction(&self, directive: Directive) -> Box<dyn Instruction> {
        match directive {
            Directive::Copy { sources, dest } => Box::new(CopyCommand::new(
                sources,
                dest,
                &self.context,
                &self.root,
                self.materializer.clone(),
            )),
            Directive::Run { command } => Box::new(RunCommand::new(
                command,
                &self.root,
                self.materializer.clone(),
                Arc::clone(&self.users),
            )),
            Directive::Env { pairs } => Box::new(EnvCommand::new(pairs)),
            Directive::Workdir { path } => Box::new(WorkdirCommand::new(path, &self.root)),
            Directive::Cmd { exec } => Box::new(CmdCommand::new(exec)),
            Directive::Entrypoint { exec } => Box::new(EntrypointCommand::new(exec)),
            Directive::User { user } => Box::new(UserCommand::new(user)),
            Directive::Label { pairs } => Box::new(LabelCommand::new(pairs)),
            Directive::Expose { ports } => Box::new(ExposeCommand::new(ports)),
            Directive::Arg { name, default } => Box::new(ArgCommand::new(name, default)),
        }
    }

    pub fn instructions(
        &self,
        directives: impl IntoIterator<Item = Directive>,
    ) -> Vec<Box<dyn Instruction>> {
        directives
            .into_iter()
            .map(|d| self.instruction(d))
            .collect()
    }
}

impl fmt::Debug for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuilder")
            .field("context", &self.context)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Join a possibly relative image path onto the working directory.
pub(crate) fn resolve_image_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

/// Map an absolute image path to its location under `root`.
pub(crate) fn host_path(root: &Path, image_path: &str) -> PathBuf {
    let relative = image_path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
