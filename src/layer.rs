//! Content-addressed cache of extracted function layers.
//!
//! A layer is a versioned zip of auxiliary files. The cache extracts each
//! layer once, under a key derived from its identity and content hash, and
//! publishes the extracted directory with an atomic rename. Once a key is
//! observable its contents never change, which is what lets the pool bind
//! mount cache directories read-only into many sandboxes at once.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::driver::{LAYER_GUEST_ROOT, LayerMount};
use crate::function::{Layer, RuntimeClass};

/// Errors raised while preparing layers.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("layer {0} is not a valid zip archive: {1}")]
    BadArchive(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache key for a layer: identity, version, and a content-hash prefix.
///
/// The key is a deterministic function of `(id, version, sha256(content))`,
/// so re-uploading identical content maps to the same directory and any
/// content change maps to a new one.
pub fn cache_key(layer: &Layer) -> String {
    let digest = Sha256::digest(&layer.content);
    let mut prefix = String::with_capacity(16);
    for byte in &digest[..8] {
        prefix.push_str(&format!("{byte:02x}"));
    }
    format!("{}-v{}-{}", layer.id, layer.version, prefix)
}

/// Mounts and environment contributions for one invocation's layers.
#[derive(Debug, Clone, Default)]
pub struct PreparedLayers {
    /// One read-only bind mount per layer, in declaration order.
    pub mounts: Vec<LayerMount>,
    /// Search-path environment contributions
    /// (e.g. `PYTHONPATH=/opt/layers/<key>:...`).
    pub env: HashMap<String, String>,
}

/// The host-side layer cache directory.
///
/// All methods are synchronous filesystem work; async callers run them on
/// the blocking pool.
#[derive(Debug, Clone)]
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory a layer extracts to.
    pub fn dir_for(&self, layer: &Layer) -> PathBuf {
        self.root.join(cache_key(layer))
    }

    /// Extracts the layer into the cache unless it is already present, and
    /// returns the published directory.
    ///
    /// Concurrent extractors of the same key race benignly: each extracts
    /// into its own temp directory and the losing renamer discards its copy.
    pub fn ensure(&self, layer: &Layer) -> Result<PathBuf, LayerError> {
        let key = cache_key(layer);
        let dest = self.root.join(&key);
        if dest.is_dir() {
            debug!(layer = %layer.id, key = %key, "layer cache hit");
            return Ok(dest);
        }

        std::fs::create_dir_all(&self.root)?;
        // Extract into a sibling temp directory, then publish with an
        // atomic rename. The TempDir cleans itself up on any error path.
        let staging = tempfile::Builder::new().prefix(".tmp-").tempdir_in(&self.root)?;
        extract_zip(&layer.id, &layer.content, staging.path())?;

        let staging = staging.keep();
        match std::fs::rename(&staging, &dest) {
            Ok(()) => {
                debug!(layer = %layer.id, key = %key, "layer extracted");
                Ok(dest)
            }
            Err(_) if dest.is_dir() => {
                // Another extractor published first.
                let _ = std::fs::remove_dir_all(&staging);
                Ok(dest)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                Err(LayerError::Io(e))
            }
        }
    }

    /// Extracts every layer and assembles the mounts and environment
    /// contributions for one invocation.
    ///
    /// Guest paths are key-addressed (`/opt/layers/<key>`) so pooled
    /// sandboxes with the whole-cache mount and one-off sandboxes with
    /// per-layer mounts see identical paths.
    pub fn prepare(
        &self,
        runtime: RuntimeClass,
        layers: &[Layer],
    ) -> Result<PreparedLayers, LayerError> {
        if layers.is_empty() {
            return Ok(PreparedLayers::default());
        }

        let mut mounts = Vec::with_capacity(layers.len());
        let mut guest_dirs = Vec::with_capacity(layers.len());
        for layer in layers {
            let host_dir = self.ensure(layer)?;
            let guest_dir = Path::new(LAYER_GUEST_ROOT).join(cache_key(layer));
            guest_dirs.push(guest_dir.to_string_lossy().into_owned());
            mounts.push(LayerMount { host_dir, guest_dir });
        }

        let mut env = HashMap::new();
        env.insert(runtime.layer_path_var().to_string(), guest_dirs.join(":"));
        Ok(PreparedLayers { mounts, env })
    }
}

/// Unpacks a zip archive into `dest`.
///
/// Entries whose cleaned path would escape `dest` are skipped, not
/// extracted.
fn extract_zip(layer_id: &str, data: &[u8], dest: &Path) -> Result<(), LayerError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| LayerError::BadArchive(layer_id.to_string(), e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| LayerError::BadArchive(layer_id.to_string(), e.to_string()))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = %entry.name(), "skipping zip entry escaping the destination");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}
