//! Build driver.
//!
//! Runs instructions strictly in order against the root filesystem. For each
//! filesystem-changing instruction the driver computes a fingerprint, asks
//! the layer cache for a prebuilt layer, and either replays that layer or
//! executes the instruction for real and snapshots its effects into a new
//! layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_build_core::config::BuildOptions;
use a3s_build_core::error::{BuildError, Result};

use crate::archive::Materializer;
use crate::args::BuildArgs;
use crate::cache::{LayerCache, LocalLayerCache};
use crate::commands::Instruction;
use crate::image::{FileLayer, Image, ImageConfig, Layer, LayeredImage};
use crate::key::CompositeKey;
use crate::layout::{write_layout, HistoryEntry};
use crate::resolve::normalize;
use crate::snapshot::{DirSnapshotter, Snapshotter};

/// Parent digest used when building from scratch.
pub const SCRATCH_DIGEST: &str = "scratch";

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildResult {
    /// Base layers plus new layers, with the final config
    pub image: LayeredImage,
    /// Image digest
    pub digest: String,
    /// Number of layers
    pub layer_count: usize,
    /// Instructions served from the layer cache
    pub cache_hits: usize,
    /// One entry per base layer and instruction
    pub history: Vec<HistoryEntry>,
    /// Manifest digest of the OCI layout, when one was written
    pub manifest_digest: Option<String>,
    /// Keeps snapshot layers alive when no work dir was configured
    _scratch: Option<tempfile::TempDir>,
}

/// Executes an instruction list into an image.
pub struct Builder {
    options: BuildOptions,
    base: Option<Arc<dyn Image>>,
    cache: Option<Arc<dyn LayerCache>>,
    materializer: Materializer,
}

/// Mutable state accumulated during the build.
struct BuildState {
    config: ImageConfig,
    args: BuildArgs,
    image: LayeredImage,
    history: Vec<HistoryEntry>,
    /// Fingerprint of the previous instruction (or the base image digest)
    chain: String,
    /// Set after the first miss; later lookups cannot match
    stop_cache: bool,
    cache_hits: usize,
    context: PathBuf,
    snapshotter: DirSnapshotter,
    cache: Option<Arc<dyn LayerCache>>,
}

impl Builder {
    pub fn new(options: BuildOptions) -> Self {
        Self {
            options,
            base: None,
            cache: None,
            materializer: Materializer::new(),
        }
    }

    /// Build on top of `image` instead of scratch.
    pub fn with_base_image(mut self, image: Arc<dyn Image>) -> Self {
        self.base = Some(image);
        self
    }

    /// Use `cache` for lookups and pushes, regardless of the cache options.
    pub fn with_cache(mut self, cache: Arc<dyn LayerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a custom materializer for base-layer unpacking.
    pub fn with_materializer(mut self, materializer: Materializer) -> Self {
        self.materializer = materializer;
        self
    }

    /// Execute `instructions` in order.
    pub async fn build(&self, mut instructions: Vec<Box<dyn Instruction>>) -> Result<BuildResult> {
        self.options.validate()?;
        let root = self.options.root_dir.clone();

        let args = BuildArgs::from_overrides(&self.options.build_args)?;

        let (scratch, work_dir) = match self.options.work_dir {
            Some(ref dir) => (None, dir.clone()),
            None => {
                let tmp = tempfile::TempDir::new().map_err(|e| {
                    BuildError::Snapshot(format!("Failed to create build directory: {}", e))
                })?;
                let path = tmp.path().to_path_buf();
                (Some(tmp), path)
            }
        };

        let mut local_cache = None;
        let cache: Option<Arc<dyn LayerCache>> = match self.cache {
            Some(ref cache) => Some(Arc::clone(cache)),
            None if self.options.cache.enabled => {
                let local = LocalLayerCache::from_options(&self.options.cache)?;
                local_cache = Some(local.clone());
                Some(Arc::new(local))
            }
            None => None,
        };

        let mut snapshotter = DirSnapshotter::new(&root, &work_dir, self.options.snapshot_mode);
        for path in &self.options.ignore_paths {
            snapshotter.ignore(path);
        }
        if let Some(ref local) = local_cache {
            snapshotter.ignore(local.cache_dir());
        }
        if let Some(ref dir) = self.options.output_dir {
            snapshotter.ignore(dir);
        }

        let (image, chain) = match self.base {
            Some(ref base) => (LayeredImage::from_image(base.as_ref())?, base.digest()?),
            None => (LayeredImage::default(), SCRATCH_DIGEST.to_string()),
        };

        if instructions.iter().any(|i| i.requires_unpacked_fs()) {
            self.unpack_base(&image, &root)?;
        }
        snapshotter.init()?;

        let history = image
            .layer_list()
            .iter()
            .map(|layer| HistoryEntry {
                created_by: format!("base layer {}", layer.digest()),
                empty_layer: false,
            })
            .collect();

        let mut state = BuildState {
            config: image.config_ref().clone(),
            args,
            image,
            history,
            chain,
            stop_cache: false,
            cache_hits: 0,
            context: normalize(&self.options.context_dir),
            snapshotter,
            cache,
        };

        let total = instructions.len();
        for (idx, instruction) in instructions.iter_mut().enumerate() {
            let description = instruction.describe();
            tracing::info!(step = idx + 1, total, "Step {}/{}: {}", idx + 1, total, description);

            self.step(instruction.as_mut(), &mut state)
                .await
                .map_err(|e| e.for_instruction(description.clone()))?;
        }

        let unused = state.args.unused_overrides();
        if !unused.is_empty() {
            tracing::warn!(args = ?unused, "Build arguments were supplied but never declared");
        }

        let mut image = state.image;
        *image.config_mut() = state.config;
        let digest = image.digest()?;

        let manifest_digest = match self.options.output_dir {
            Some(ref dir) => Some(write_layout(
                &image,
                &state.history,
                &self.options.reference,
                dir,
            )?),
            None => None,
        };

        if let Some(ref local) = local_cache {
            if self.options.cache.max_size_bytes > 0 {
                let evicted = local.prune(self.options.cache.max_size_bytes)?;
                if evicted > 0 {
                    tracing::debug!(evicted, "Pruned layer cache");
                }
            }
        }

        let layer_count = image.layer_list().len();
        tracing::info!(
            digest = %digest,
            layers = layer_count,
            cache_hits = state.cache_hits,
            "Successfully built {}",
            self.options.reference
        );

        Ok(BuildResult {
            image,
            digest,
            layer_count,
            cache_hits: state.cache_hits,
            history: state.history,
            manifest_digest,
            _scratch: scratch,
        })
    }

    fn unpack_base(&self, image: &LayeredImage, root: &Path) -> Result<()> {
        for layer in image.layer_list() {
            tracing::debug!(digest = %layer.digest(), "Unpacking base layer");
            let reader = layer.uncompressed()?;
            self.materializer.materialize(reader, root)?;
        }
        Ok(())
    }

    async fn step(&self, instruction: &mut dyn Instruction, state: &mut BuildState) -> Result<()> {
        // Substitution happens here first, so argument errors surface before
        // anything touches the filesystem.
        let context_files = instruction.files_used_from_context(&state.config, &state.args)?;
        let text = instruction.resolved_text(&state.config, &state.args)?;

        let mut key = CompositeKey::new(&state.chain);
        key.add_key(text);
        key.add_context_files(&state.context, &context_files)?;
        let key = key.hash();
        state.chain = key.clone();

        let mut hit = false;
        if let Some(ref cache) = state.cache {
            if !state.stop_cache
                && instruction.should_cache_output()
                && !instruction.is_metadata_only()
            {
                match cache.retrieve_layer(&key).await {
                    Ok(image) => {
                        tracing::info!(key = %key, "Using cached layer");
                        instruction.mark_cached(true);
                        instruction.attach_image(image);
                        hit = true;
                    }
                    Err(e) => {
                        if e.is_not_found() {
                            tracing::debug!(key = %key, "No cached layer found");
                        } else {
                            tracing::warn!(key = %key, error = %e, "Cache lookup failed, executing instead");
                        }
                        state.stop_cache = true;
                    }
                }
            }
        }

        instruction.execute(&mut state.config, &mut state.args)?;

        let created_by = instruction.describe();
        if instruction.is_metadata_only() {
            state.history.push(HistoryEntry {
                created_by,
                empty_layer: true,
            });
            return Ok(());
        }

        if hit {
            let layer = instruction.layer().ok_or_else(|| {
                BuildError::CacheIntegrity("cached instruction has no layer".to_string())
            })?;
            state.image.push_layer(layer);
            state.history.push(HistoryEntry {
                created_by,
                empty_layer: false,
            });
            state.cache_hits += 1;
            // Replayed files are part of the tree from now on
            state.snapshotter.init()?;
            return Ok(());
        }

        let files = instruction.files_to_snapshot();
        let snapshot = if !files.is_empty() {
            state.snapshotter.take_snapshot(&files)?
        } else if instruction.requires_unpacked_fs() {
            state.snapshotter.take_snapshot_fs()?
        } else {
            None
        };

        let Some(path) = snapshot else {
            tracing::debug!("Instruction produced no filesystem changes");
            state.history.push(HistoryEntry {
                created_by,
                empty_layer: true,
            });
            return Ok(());
        };

        let layer: Arc<dyn Layer> = Arc::new(FileLayer::open(&path)?);
        state.image.push_layer(Arc::clone(&layer));
        state.history.push(HistoryEntry {
            created_by,
            empty_layer: false,
        });

        if instruction.should_cache_output() {
            if let Some(ref cache) = state.cache {
                cache.push(&key, Arc::clone(&layer)).await?;
                tracing::info!(key = %key, digest = %layer.digest(), "Pushed layer to cache");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryLayerCache;
    use crate::commands::{CommandBuilder, Directive};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        context: TempDir,
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let context = TempDir::new().unwrap();
            std::fs::write(context.path().join("app.py"), "print('hi')").unwrap();
            std::fs::create_dir(context.path().join("lib")).unwrap();
            std::fs::write(context.path().join("lib/util.py"), "pass").unwrap();
            Self {
                context,
                root: TempDir::new().unwrap(),
            }
        }

        fn options(&self) -> BuildOptions {
            BuildOptions {
                context_dir: self.context.path().to_path_buf(),
                root_dir: self.root.path().to_path_buf(),
                ..Default::default()
            }
        }

        fn fresh_root(&mut self) {
            self.root = TempDir::new().unwrap();
        }
    }

    fn copy(src: &str, dest: &str) -> Directive {
        Directive::Copy {
            sources: vec![src.to_string()],
            dest: dest.to_string(),
        }
    }

    fn directives() -> Vec<Directive> {
        vec![
            Directive::Arg {
                name: "APP_DIR".to_string(),
                default: Some("/app".to_string()),
            },
            Directive::Workdir {
                path: "${APP_DIR}".to_string(),
            },
            copy("app.py", "./"),
            copy("lib", "lib/"),
            Directive::Env {
                pairs: vec![("MODE".to_string(), "prod".to_string())],
            },
            Directive::Cmd {
                exec: vec!["python".to_string(), "app.py".to_string()],
            },
        ]
    }

    /// A cache whose lookups always fail with a transport error.
    struct BrokenCache {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl LayerCache for BrokenCache {
        async fn retrieve_layer(&self, _key: &str) -> Result<Arc<dyn Image>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Err(BuildError::CacheLookup("connection refused".to_string()))
        }

        async fn push(&self, _key: &str, _layer: Arc<dyn Layer>) -> Result<()> {
            Ok(())
        }
    }

    struct RejectingCache;

    #[async_trait]
    impl LayerCache for RejectingCache {
        async fn retrieve_layer(&self, key: &str) -> Result<Arc<dyn Image>> {
            Err(BuildError::CacheNotFound(key.to_string()))
        }

        async fn push(&self, _key: &str, _layer: Arc<dyn Layer>) -> Result<()> {
            Err(BuildError::Cache("read-only cache".to_string()))
        }
    }

    #[tokio::test]
    async fn test_build_without_cache() {
        let fx = Fixture::new();
        let options = fx.options();
        let instructions = CommandBuilder::new(&options).instructions(directives());

        let result = Builder::new(options).build(instructions).await.unwrap();

        assert!(fx.root.path().join("app/app.py").is_file());
        assert!(fx.root.path().join("app/lib/util.py").is_file());
        // WORKDIR, COPY, COPY
        assert_eq!(result.layer_count, 3);
        assert_eq!(result.cache_hits, 0);
        let config = result.image.config_ref();
        assert_eq!(config.working_dir, "/app");
        assert_eq!(config.env, vec!["MODE=prod"]);
        assert_eq!(
            config.cmd,
            Some(vec!["python".to_string(), "app.py".to_string()])
        );
        assert_eq!(result.history.len(), 6);
        assert!(result.history[0].empty_layer);
        assert!(!result.history[2].empty_layer);
        assert!(result.digest.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_second_build_hits_cache() {
        let mut fx = Fixture::new();
        let cache = Arc::new(MemoryLayerCache::new());

        let options = fx.options();
        let first = Builder::new(options.clone())
            .with_cache(cache.clone())
            .build(CommandBuilder::new(&options).instructions(directives()))
            .await
            .unwrap();
        assert_eq!(first.cache_hits, 0);
        assert_eq!(cache.len(), 2);

        fx.fresh_root();
        let options = fx.options();
        let second = Builder::new(options.clone())
            .with_cache(cache.clone())
            .build(CommandBuilder::new(&options).instructions(directives()))
            .await
            .unwrap();

        assert_eq!(second.cache_hits, 2);
        assert_eq!(
            std::fs::read_to_string(fx.root.path().join("app/lib/util.py")).unwrap(),
            "pass"
        );
        let first_digests: Vec<String> = first
            .image
            .layer_list()
            .iter()
            .skip(1)
            .map(|l| l.digest().to_string())
            .collect();
        let second_digests: Vec<String> = second
            .image
            .layer_list()
            .iter()
            .skip(1)
            .map(|l| l.digest().to_string())
            .collect();
        assert_eq!(first_digests, second_digests);
    }

    #[tokio::test]
    async fn test_context_change_invalidates_and_stops_cache() {
        let mut fx = Fixture::new();
        let cache = Arc::new(MemoryLayerCache::new());

        let options = fx.options();
        Builder::new(options.clone())
            .with_cache(cache.clone())
            .build(CommandBuilder::new(&options).instructions(directives()))
            .await
            .unwrap();

        std::fs::write(fx.context.path().join("app.py"), "print('changed')").unwrap();
        fx.fresh_root();
        let options = fx.options();
        let result = Builder::new(options.clone())
            .with_cache(cache.clone())
            .build(CommandBuilder::new(&options).instructions(directives()))
            .await
            .unwrap();

        // The first COPY misses, so the second is not looked up at all
        assert_eq!(result.cache_hits, 0);
        assert_eq!(
            std::fs::read_to_string(fx.root.path().join("app/app.py")).unwrap(),
            "print('changed')"
        );
    }

    #[tokio::test]
    async fn test_lookup_errors_degrade_to_miss() {
        let fx = Fixture::new();
        let cache = Arc::new(BrokenCache {
            lookups: AtomicUsize::new(0),
        });
        let options = fx.options();
        let result = Builder::new(options.clone())
            .with_cache(cache.clone())
            .build(CommandBuilder::new(&options).instructions(directives()))
            .await
            .unwrap();

        assert_eq!(result.cache_hits, 0);
        assert_eq!(cache.lookups.load(Ordering::SeqCst), 1);
        assert!(fx.root.path().join("app/app.py").is_file());
    }

    #[tokio::test]
    async fn test_push_failure_aborts() {
        let fx = Fixture::new();
        let options = fx.options();
        let err = Builder::new(options.clone())
            .with_cache(Arc::new(RejectingCache))
            .build(CommandBuilder::new(&options).instructions(vec![copy("app.py", "/")]))
            .await
            .err()
            .unwrap();

        assert!(err.to_string().starts_with("COPY app.py /: "));
        assert!(matches!(err.root_cause(), BuildError::Cache(_)));
    }

    #[tokio::test]
    async fn test_undeclared_arg_attributed_to_instruction() {
        let fx = Fixture::new();
        let options = fx.options();
        let err = Builder::new(options.clone())
            .build(CommandBuilder::new(&options).instructions(vec![copy("app.py", "/$NOPE/")]))
            .await
            .err()
            .unwrap();

        assert!(err.to_string().starts_with("COPY app.py /$NOPE/: "));
        assert!(matches!(err.root_cause(), BuildError::BuildArg(_)));
        assert_eq!(std::fs::read_dir(fx.root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_base_layers_unpacked_for_run() {
        let fx = Fixture::new();
        let mut tar = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_uid(nix::unistd::getuid().as_raw() as u64);
        header.set_gid(nix::unistd::getgid().as_raw() as u64);
        header.set_entry_type(tar::EntryType::Regular);
        tar.append_data(&mut header, "etc/base.conf", &b"base"[..])
            .unwrap();
        let base_layer: Arc<dyn Layer> =
            Arc::new(crate::image::MemoryLayer::new(tar.into_inner().unwrap()));
        let base = Arc::new(LayeredImage::new(
            vec![base_layer],
            ImageConfig {
                env: vec!["PATH=/usr/bin:/bin".to_string()],
                ..Default::default()
            },
        ));

        let options = fx.options();
        let instructions = CommandBuilder::new(&options).instructions(vec![Directive::Run {
            command: "true".to_string(),
        }]);

        // The base carries no shell, so the chrooted RUN fails at exec when
        // privileged and at chroot(2) otherwise. Either way the base is
        // unpacked first.
        let err = Builder::new(options)
            .with_base_image(base)
            .build(instructions)
            .await
            .unwrap_err();

        assert_eq!(
            std::fs::read_to_string(fx.root.path().join("etc/base.conf")).unwrap(),
            "base"
        );
        assert!(err.to_string().starts_with("RUN true: "), "{}", err);
        let expected = if nix::unistd::geteuid().is_root() {
            std::io::ErrorKind::NotFound
        } else {
            std::io::ErrorKind::PermissionDenied
        };
        match err.root_cause() {
            BuildError::Io(e) => assert_eq!(e.kind(), expected, "{}", e),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_into_tmp_produces_layer() {
        let fx = Fixture::new();
        let options = fx.options();
        let cache = Arc::new(MemoryLayerCache::new());
        let result = Builder::new(options.clone())
            .with_cache(cache.clone())
            .build(CommandBuilder::new(&options).instructions(vec![copy("app.py", "/tmp/app.py")]))
            .await
            .unwrap();

        assert!(fx.root.path().join("tmp/app.py").is_file());
        assert_eq!(result.layer_count, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_only_build_has_no_layers() {
        let fx = Fixture::new();
        let options = fx.options();
        let result = Builder::new(options.clone())
            .with_cache(Arc::new(BrokenCache {
                lookups: AtomicUsize::new(0),
            }))
            .build(CommandBuilder::new(&options).instructions(vec![
                Directive::Env {
                    pairs: vec![("A".to_string(), "1".to_string())],
                },
                Directive::Label {
                    pairs: vec![("k".to_string(), "v".to_string())],
                },
            ]))
            .await
            .unwrap();
        assert_eq!(result.layer_count, 0);
        assert!(result.history.iter().all(|h| h.empty_layer));
    }

    #[tokio::test]
    async fn test_writes_oci_layout() {
        let fx = Fixture::new();
        let out = TempDir::new().unwrap();
        let mut options = fx.options();
        options.output_dir = Some(out.path().to_path_buf());
        let result = Builder::new(options.clone())
            .build(CommandBuilder::new(&options).instructions(vec![copy("app.py", "/")]))
            .await
            .unwrap();

        assert!(result.manifest_digest.is_some());
        assert!(out.path().join("index.json").is_file());
        assert!(out.path().join("oci-layout").is_file());
    }
}
