//! Layer cache: fingerprint → single-layer image.
//!
//! The driver consults the cache before executing a filesystem-changing
//! instruction and pushes freshly built layers back afterwards. Two stores
//! are provided: a directory of gzip-compressed layers for reuse across
//! builds, and an in-process map.

use std::collections::HashMap;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_build_core::config::CacheOptions;
use a3s_build_core::error::{BuildError, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::image::{FileLayer, Image, Layer, LayeredImage, MemoryLayer};

/// Store of previously built layers keyed by fingerprint.
#[async_trait]
pub trait LayerCache: Send + Sync {
    /// Fetch the image cached under `key`.
    ///
    /// Fails with [`BuildError::CacheNotFound`] when nothing is cached.
    async fn retrieve_layer(&self, key: &str) -> Result<Arc<dyn Image>>;

    /// Publish a freshly built layer under `key`.
    async fn push(&self, key: &str, layer: Arc<dyn Layer>) -> Result<()>;
}

/// Metadata for a cached layer entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMeta {
    /// Cache key (fingerprint)
    pub key: String,
    /// Digest of the uncompressed layer
    pub digest: String,
    /// Size of the compressed layer file in bytes
    pub size_bytes: u64,
    /// When this layer was cached (Unix timestamp)
    pub cached_at: i64,
    /// Last time this layer was retrieved (Unix timestamp)
    pub last_accessed: i64,
}

/// Layers stored as `<key>.tar.gz` with `<key>.meta.json` alongside.
#[derive(Debug, Clone)]
pub struct LocalLayerCache {
    cache_dir: PathBuf,
    /// Entries older than this many seconds are ignored (0 = never expire)
    ttl_secs: i64,
}

impl LocalLayerCache {
    /// Create a cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            BuildError::Cache(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            ttl_secs: 0,
        })
    }

    /// Create a cache from build options.
    pub fn from_options(options: &CacheOptions) -> Result<Self> {
        let cache = Self::new(&options.resolved_dir()?)?;
        Ok(cache.with_ttl_hours(options.ttl_hours))
    }

    /// Treat entries older than `hours` as missing.
    pub fn with_ttl_hours(mut self, hours: u64) -> Self {
        self.ttl_secs = (hours as i64).saturating_mul(3600);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_paths(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(BuildError::Cache(format!("invalid cache key '{}'", key)));
        }
        let name = key.replace(':', "_");
        Ok((
            self.cache_dir.join(format!("{}.tar.gz", name)),
            self.cache_dir.join(format!("{}.meta.json", name)),
        ))
    }

    fn is_expired(&self, meta: &LayerMeta) -> bool {
        self.ttl_secs > 0 && chrono::Utc::now().timestamp() - meta.cached_at > self.ttl_secs
    }

    /// Look up a cached layer, refreshing its access time.
    ///
    /// Returns `None` if the layer is not cached, expired, or the entry is
    /// incomplete.
    pub fn get(&self, key: &str) -> Result<Option<(PathBuf, LayerMeta)>> {
        let (layer_path, meta_path) = self.entry_paths(key)?;
        if !layer_path.is_file() || !meta_path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&meta_path).map_err(|e| {
            BuildError::CacheLookup(format!(
                "Failed to read layer metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;
        let mut meta: LayerMeta = serde_json::from_str(&content).map_err(|e| {
            BuildError::CacheLookup(format!(
                "Corrupt layer metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;

        if self.is_expired(&meta) {
            tracing::debug!(key = %key, cached_at = meta.cached_at, "Cached layer expired");
            return Ok(None);
        }

        meta.last_accessed = chrono::Utc::now().timestamp();
        match serde_json::to_string_pretty(&meta) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&meta_path, json) {
                    tracing::debug!(
                        key = %key,
                        path = %meta_path.display(),
                        error = %e,
                        "Failed to record layer access time"
                    );
                }
            }
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Failed to serialize layer metadata");
            }
        }

        Ok(Some((layer_path, meta)))
    }

    /// Store a layer under `key`, replacing any existing entry.
    pub fn put(&self, key: &str, layer: &dyn Layer) -> Result<LayerMeta> {
        let (layer_path, meta_path) = self.entry_paths(key)?;

        let tmp = tempfile::NamedTempFile::new_in(&self.cache_dir).map_err(|e| {
            BuildError::Cache(format!("Failed to create temporary cache file: {}", e))
        })?;
        {
            let mut encoder = GzEncoder::new(BufWriter::new(tmp.as_file()), Compression::default());
            let mut reader = layer.uncompressed()?;
            io::copy(&mut reader, &mut encoder).map_err(|e| {
                BuildError::Cache(format!("Failed to write cached layer {}: {}", key, e))
            })?;
            encoder.finish().and_then(|mut w| io::Write::flush(&mut w)).map_err(|e| {
                BuildError::Cache(format!("Failed to finalize cached layer {}: {}", key, e))
            })?;
        }
        tmp.persist(&layer_path).map_err(|e| {
            BuildError::Cache(format!(
                "Failed to store cached layer {}: {}",
                layer_path.display(),
                e
            ))
        })?;

        let size_bytes = std::fs::metadata(&layer_path).map(|m| m.len()).unwrap_or(0);
        let now = chrono::Utc::now().timestamp();
        let meta = LayerMeta {
            key: key.to_string(),
            digest: layer.digest().to_string(),
            size_bytes,
            cached_at: now,
            last_accessed: now,
        };
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?).map_err(|e| {
            BuildError::Cache(format!(
                "Failed to write layer metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;

        tracing::debug!(
            key = %key,
            digest = %meta.digest,
            size_bytes,
            path = %layer_path.display(),
            "Cached build layer"
        );

        Ok(meta)
    }

    /// Remove a cached layer.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        let (layer_path, meta_path) = self.entry_paths(key)?;
        for path in [&layer_path, &meta_path] {
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| {
                    BuildError::Cache(format!(
                        "Failed to remove cache entry {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Prune the cache to stay within the given byte limit.
    ///
    /// Evicts least-recently-accessed entries first.
    /// Returns the number of entries evicted.
    pub fn prune(&self, max_bytes: u64) -> Result<usize> {
        let mut entries = self.list_entries()?;

        let total_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if total_size <= max_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|e| e.last_accessed);

        let mut current_size = total_size;
        let mut evicted = 0;

        for entry in &entries {
            if current_size <= max_bytes {
                break;
            }
            self.invalidate(&entry.key)?;
            current_size = current_size.saturating_sub(entry.size_bytes);
            evicted += 1;

            tracing::debug!(
                key = %entry.key,
                size_bytes = entry.size_bytes,
                "Evicted cached layer"
            );
        }

        Ok(evicted)
    }

    /// List all cached layer entries with their metadata.
    pub fn list_entries(&self) -> Result<Vec<LayerMeta>> {
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            BuildError::Cache(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| {
                BuildError::Cache(format!("Failed to read directory entry: {}", e))
            })?;
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".meta.json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(meta) = serde_json::from_str::<LayerMeta>(&content) {
                    entries.push(meta);
                }
            }
        }

        Ok(entries)
    }

    /// Get the total size of all cached layers in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }
}

#[async_trait]
impl LayerCache for LocalLayerCache {
    async fn retrieve_layer(&self, key: &str) -> Result<Arc<dyn Image>> {
        let (path, meta) = self
            .get(key)?
            .ok_or_else(|| BuildError::CacheNotFound(key.to_string()))?;
        let layer = FileLayer::with_digest(&path, &meta.digest)?;
        Ok(Arc::new(LayeredImage::single(Arc::new(layer))))
    }

    async fn push(&self, key: &str, layer: Arc<dyn Layer>) -> Result<()> {
        let cache = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || cache.put(&key, layer.as_ref()))
            .await
            .map_err(|e| BuildError::Cache(format!("Cache write task failed: {}", e)))??;
        Ok(())
    }
}

/// In-process layer cache.
#[derive(Debug, Default)]
pub struct MemoryLayerCache {
    layers: Mutex<HashMap<String, Arc<dyn Layer>>>,
}

impl MemoryLayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.layers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.lock().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.layers.lock().contains_key(key)
    }
}

#[async_trait]
impl LayerCache for MemoryLayerCache {
    async fn retrieve_layer(&self, key: &str) -> Result<Arc<dyn Image>> {
        let layer = self
            .layers
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BuildError::CacheNotFound(key.to_string()))?;
        Ok(Arc::new(LayeredImage::single(layer)))
    }

    async fn push(&self, key: &str, layer: Arc<dyn Layer>) -> Result<()> {
        // Snapshot files live in scratch space, so keep a private copy.
        let mut data = Vec::new();
        io::copy(&mut layer.uncompressed()?, &mut data)
            .map_err(|e| BuildError::Cache(format!("Failed to read layer {}: {}", key, e)))?;
        self.layers
            .lock()
            .insert(key.to_string(), Arc::new(MemoryLayer::new(data)));
        Ok(())
    }
}
