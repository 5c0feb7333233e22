//! Image and layer representation.
//!
//! A layer is an immutable tar stream with a content digest; an image is an
//! ordered list of layers plus the runtime configuration record. Both are
//! traits so the layer cache, the snapshotter and tests can supply their own
//! backing storage.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content-addressed filesystem delta.
pub trait Layer: Send + Sync + fmt::Debug {
    /// Digest of the uncompressed tar stream (`sha256:<hex>`).
    fn digest(&self) -> &str;

    /// Open the uncompressed tar stream.
    fn uncompressed(&self) -> Result<Box<dyn Read + Send + '_>>;
}

/// An ordered sequence of layers plus configuration.
pub trait Image: Send + Sync {
    /// The image layers, bottom to top.
    fn layers(&self) -> Result<Vec<Arc<dyn Layer>>>;

    /// The runtime configuration record.
    fn config(&self) -> Result<ImageConfig>;

    /// Digest identifying this image's content and configuration.
    fn digest(&self) -> Result<String>;
}

/// Runtime configuration carried by an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    /// Default command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    /// Entrypoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    /// Environment as ordered `NAME=value` strings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Working directory (empty means `/`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    /// User to run as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Exposed ports (`80/tcp`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exposed_ports: Vec<String>,

    /// Labels in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<(String, String)>,
}

impl ImageConfig {
    /// Working directory, defaulting to `/`.
    pub fn working_dir(&self) -> &str {
        if self.working_dir.is_empty() {
            "/"
        } else {
            &self.working_dir
        }
    }

    /// Set `key` in the environment, replacing an existing entry in place.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let prefix = format!("{}=", key);
        match self.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }

    /// Set a label, replacing an existing one with the same key.
    pub fn set_label(&mut self, key: &str, value: &str) {
        match self.labels.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_string(),
            None => self.labels.push((key.to_string(), value.to_string())),
        }
    }
}

/// A layer backed by a tar file on disk, optionally gzip-compressed.
#[derive(Debug, Clone)]
pub struct FileLayer {
    path: PathBuf,
    digest: String,
    compressed: bool,
}

impl FileLayer {
    /// Open a layer file, computing the digest of its uncompressed content.
    pub fn open(path: &Path) -> Result<Self> {
        let compressed = is_gzip(path)?;
        let mut layer = Self {
            path: path.to_path_buf(),
            digest: String::new(),
            compressed,
        };
        let mut reader = layer.uncompressed()?;
        let digest = sha256_reader(&mut reader)?;
        drop(reader);
        layer.digest = format!("sha256:{}", digest);
        Ok(layer)
    }

    /// Wrap a layer file whose uncompressed digest is already known.
    pub fn with_digest(path: &Path, digest: &str) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            digest: digest.to_string(),
            compressed: is_gzip(path)?,
        })
    }

    /// Path to the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Layer for FileLayer {
    fn digest(&self) -> &str {
        &self.digest
    }

    fn uncompressed(&self) -> Result<Box<dyn Read + Send + '_>> {
        let file = File::open(&self.path).map_err(|e| {
            BuildError::CacheLookup(format!(
                "Failed to open layer {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let reader = BufReader::new(file);
        if self.compressed {
            Ok(Box::new(GzDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }
}

/// A layer held in memory as an uncompressed tar stream.
#[derive(Clone)]
pub struct MemoryLayer {
    data: Arc<Vec<u8>>,
    digest: String,
}

impl MemoryLayer {
    /// Wrap raw tar bytes.
    pub fn new(data: Vec<u8>) -> Self {
        let digest = format!("sha256:{}", sha256_bytes(&data));
        Self {
            data: Arc::new(data),
            digest,
        }
    }

    /// A layer with no tar content at all.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for MemoryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLayer")
            .field("digest", &self.digest)
            .field("size", &self.data.len())
            .finish()
    }
}

impl Layer for MemoryLayer {
    fn digest(&self) -> &str {
        &self.digest
    }

    fn uncompressed(&self) -> Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }
}

/// An image assembled in memory from layers and a config.
#[derive(Clone, Default)]
pub struct LayeredImage {
    layers: Vec<Arc<dyn Layer>>,
    config: ImageConfig,
}

impl LayeredImage {
    /// Create an image from its parts.
    pub fn new(layers: Vec<Arc<dyn Layer>>, config: ImageConfig) -> Self {
        Self { layers, config }
    }

    /// An image holding exactly one layer, as stored by layer caches.
    pub fn single(layer: Arc<dyn Layer>) -> Self {
        Self::new(vec![layer], ImageConfig::default())
    }

    /// Snapshot any image into a `LayeredImage`.
    pub fn from_image(image: &dyn Image) -> Result<Self> {
        Ok(Self::new(image.layers()?, image.config()?))
    }

    /// Append a layer on top.
    pub fn push_layer(&mut self, layer: Arc<dyn Layer>) {
        self.layers.push(layer);
    }

    /// Layers, bottom to top.
    pub fn layer_list(&self) -> &[Arc<dyn Layer>] {
        &self.layers
    }

    /// Borrow the configuration.
    pub fn config_ref(&self) -> &ImageConfig {
        &self.config
    }

    /// Mutably borrow the configuration.
    pub fn config_mut(&mut self) -> &mut ImageConfig {
        &mut self.config
    }
}

impl fmt::Debug for LayeredImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredImage")
            .field("layers", &self.layers.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Image for LayeredImage {
    fn layers(&self) -> Result<Vec<Arc<dyn Layer>>> {
        Ok(self.layers.clone())
    }

    fn config(&self) -> Result<ImageConfig> {
        Ok(self.config.clone())
    }

    fn digest(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for layer in &self.layers {
            hasher.update(layer.digest().as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(serde_json::to_vec(&self.config)?);
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA256 digest of everything readable from `reader`.
pub fn sha256_reader(reader: &mut dyn Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        BuildError::Snapshot(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    sha256_reader(&mut file)
}

fn is_gzip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| {
        BuildError::CacheLookup(format!(
            "Failed to open layer {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}
