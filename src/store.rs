//! Artifact storage: a key-value blob store with opaque URL references.
//!
//! Cropped images, merged Markdown and cache manifests all go through
//! [`BlobStore`]. Keys are slash-separated. Crop keys embed a digest of
//! their bytes, so the only concurrency guarantee the pipeline needs is an
//! atomic create-if-absent ([`BlobStore::put_if_absent`]).
//!
//! References handed to callers are URLs ([`BlobRef`]), never file-system
//! paths: downstream delivery code must treat them as opaque.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

/// Content hash of an upload (BLAKE3, lowercase hex).
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Opaque, resolvable reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors emitted by blob storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),

    /// A stored artifact exists but cannot be decoded.
    #[error("corrupt artifact at {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Reject empty keys, absolute keys and any `..` segment.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Key-value blob storage backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError>;

    /// Store `bytes` under `key` unless the key already exists. Either way the
    /// reference to the stored blob is returned; the existing value wins.
    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError>;

    /// Fetch the blob under `key` or [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Reference a key would resolve to, without touching storage.
    fn reference(&self, key: &str) -> BlobRef;

    /// Inverse of [`BlobStore::reference`]: the key behind a reference this
    /// store handed out, `None` for foreign references.
    fn key_of(&self, reference: &BlobRef) -> Option<String>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ── In-memory store ───────────────────────────────────────────────────────

/// Process-local store, used for tests and short-lived embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn poisoned() -> StoreError {
        StoreError::Io("memory store lock poisoned".into())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError> {
        validate_key(key)?;
        self.blobs
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), bytes);
        Ok(self.reference(key))
    }

    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError> {
        validate_key(key)?;
        self.blobs
            .write()
            .map_err(|_| Self::poisoned())?
            .entry(key.to_string())
            .or_insert(bytes);
        Ok(self.reference(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.blobs
            .read()
            .map_err(|_| Self::poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn reference(&self, key: &str) -> BlobRef {
        BlobRef::new(format!("mem://{key}"))
    }

    fn key_of(&self, reference: &BlobRef) -> Option<String> {
        reference.as_str().strip_prefix("mem://").map(str::to_string)
    }
}

// ── Filesystem store ──────────────────────────────────────────────────────

/// Filesystem-backed store.
///
/// Writes go to a temp file in the destination directory and are then
/// persisted atomically: `put` renames over the target, `put_if_absent`
/// uses a no-clobber link so two racing writers cannot both win.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    /// Store rooted at `root`; references are `file://` URLs of the blobs.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base_url = format!("file://{}", root.display());
        Self { root, base_url }
    }

    /// Serve references from `base_url` instead (e.g. a CDN in front of `root`).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    async fn write_atomic(&self, key: &str, bytes: Vec<u8>, clobber: bool) -> Result<BlobRef, StoreError> {
        let path = self.path_for(key)?;
        let reference = self.reference(key);
        tokio::task::spawn_blocking(move || write_blocking(&path, &bytes, clobber))
            .await
            .map_err(|e| StoreError::Io(format!("store task panicked: {e}")))??;
        Ok(reference)
    }
}

fn write_blocking(path: &Path, bytes: &[u8], clobber: bool) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    std::fs::create_dir_all(dir)?;

    if !clobber && path.exists() {
        debug!("blob {} already present, keeping existing", path.display());
        return Ok(());
    }

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    if clobber {
        tmp.persist(path).map_err(|e| StoreError::Io(e.error.to_string()))?;
    } else {
        match tmp.persist_noclobber(path) {
            Ok(_) => {}
            // Another writer created it first; theirs stays.
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(StoreError::Io(e.error.to_string())),
        }
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError> {
        self.write_atomic(key, bytes, true).await
    }

    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef, StoreError> {
        self.write_atomic(key, bytes, false).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reference(&self, key: &str) -> BlobRef {
        BlobRef::new(format!("{}/{}", self.base_url, key))
    }

    fn key_of(&self, reference: &BlobRef) -> Option<String> {
        reference
            .as_str()
            .strip_prefix(self.base_url.as_str())?
            .strip_prefix('/')
            .map(str::to_string)
    }
}
