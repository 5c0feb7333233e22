//! OCI image layout output.
//!
//! Writes a built image as `blobs/sha256/*`, `index.json` and `oci-layout`
//! under an output directory, suitable for `skopeo copy oci:<dir>` or
//! loading into a local image store.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use a3s_build_core::error::{BuildError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::image::{sha256_bytes, ImageConfig, LayeredImage};

const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A history record in the image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_by: String,
    /// True for instructions that produced no layer
    pub empty_layer: bool,
}

/// Write `image` as an OCI layout under `output_dir`.
///
/// Returns the manifest digest (`sha256:...`).
pub fn write_layout(
    image: &LayeredImage,
    history: &[HistoryEntry],
    reference: &str,
    output_dir: &Path,
) -> Result<String> {
    let blobs_dir = output_dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        BuildError::Snapshot(format!("Failed to create output blobs dir: {}", e))
    })?;

    let mut descriptors = Vec::new();
    let mut diff_ids = Vec::new();
    for (i, layer) in image.layer_list().iter().enumerate() {
        let (digest, size) = write_layer_blob(&blobs_dir, layer.uncompressed()?)
            .map_err(|e| BuildError::Snapshot(format!("Failed to write layer {}: {}", i, e)))?;
        descriptors.push(serde_json::json!({
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": format!("sha256:{}", digest),
            "size": size
        }));
        diff_ids.push(layer.digest().to_string());
    }

    let now = chrono::Utc::now().to_rfc3339();
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    let config_obj = serde_json::json!({
        "architecture": arch,
        "os": "linux",
        "created": now,
        "config": config_section(image.config_ref()),
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids
        },
        "history": history.iter().map(|h| {
            let mut entry = serde_json::json!({
                "created": now,
                "created_by": h.created_by
            });
            if h.empty_layer {
                entry["empty_layer"] = serde_json::json!(true);
            }
            entry
        }).collect::<Vec<_>>()
    });

    let config_bytes = serde_json::to_vec_pretty(&config_obj)?;
    let config_digest = sha256_bytes(&config_bytes);
    write_blob(&blobs_dir, &config_digest, &config_bytes, "config")?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len()
        },
        "layers": descriptors
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    write_blob(&blobs_dir, &manifest_digest, &manifest_bytes, "manifest")?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": INDEX_MEDIA_TYPE,
        "manifests": [{
            "mediaType": MANIFEST_MEDIA_TYPE,
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_bytes.len(),
            "annotations": { REF_NAME_ANNOTATION: reference }
        }]
    });
    std::fs::write(
        output_dir.join("index.json"),
        serde_json::to_string_pretty(&index)?,
    )
    .map_err(|e| BuildError::Snapshot(format!("Failed to write index.json: {}", e)))?;

    std::fs::write(
        output_dir.join("oci-layout"),
        r#"{"imageLayoutVersion":"1.0.0"}"#,
    )
    .map_err(|e| BuildError::Snapshot(format!("Failed to write oci-layout: {}", e)))?;

    let digest = format!("sha256:{}", manifest_digest);
    tracing::info!(
        reference,
        digest = %digest,
        path = %output_dir.display(),
        "Wrote OCI image layout"
    );
    Ok(digest)
}

/// The `config` object of the OCI image config.
fn config_section(config: &ImageConfig) -> serde_json::Value {
    let mut section = serde_json::Map::new();
    if !config.env.is_empty() {
        section.insert("Env".to_string(), serde_json::json!(config.env));
    }
    if let Some(ref ep) = config.entrypoint {
        section.insert("Entrypoint".to_string(), serde_json::json!(ep));
    }
    if let Some(ref cmd) = config.cmd {
        section.insert("Cmd".to_string(), serde_json::json!(cmd));
    }
    if config.working_dir() != "/" {
        section.insert(
            "WorkingDir".to_string(),
            serde_json::json!(config.working_dir),
        );
    }
    if let Some(ref user) = config.user {
        section.insert("User".to_string(), serde_json::json!(user));
    }
    if !config.exposed_ports.is_empty() {
        let ports: BTreeMap<&str, serde_json::Value> = config
            .exposed_ports
            .iter()
            .map(|p| (p.as_str(), serde_json::json!({})))
            .collect();
        section.insert("ExposedPorts".to_string(), serde_json::json!(ports));
    }
    if !config.labels.is_empty() {
        let labels: BTreeMap<&str, &str> = config
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        section.insert("Labels".to_string(), serde_json::json!(labels));
    }
    serde_json::Value::Object(section)
}

/// Hashes and counts everything written through it.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Gzip a tar stream into the blob directory. Returns (hex digest, size).
fn write_layer_blob(
    blobs_dir: &Path,
    mut reader: Box<dyn io::Read + Send + '_>,
) -> Result<(String, u64)> {
    let tmp = tempfile::NamedTempFile::new_in(blobs_dir)?;
    let file: File = tmp.reopen()?;
    let writer = DigestWriter {
        inner: file,
        hasher: Sha256::new(),
        written: 0,
    };
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;

    let digest = hex::encode(writer.hasher.finalize());
    let size = writer.written;
    let blob_path = blobs_dir.join(&digest);
    if !blob_path.exists() {
        tmp.persist(&blob_path).map_err(|e| BuildError::Io(e.error))?;
    }
    Ok((digest, size))
}

fn write_blob(blobs_dir: &Path, digest: &str, bytes: &[u8], what: &str) -> Result<()> {
    std::fs::write(blobs_dir.join(digest), bytes)
        .map_err(|e| BuildError::Snapshot(format!("Failed to write {} blob: {}", what, e)))
}
