//! Blob store adapter
//!
//! Uniform interface to an object store: put/get/list/delete under a
//! namespaced key hierarchy, with per-object metadata tags. Transient
//! transport failures are distinguishable from NotFound; retry policy lives
//! in callers, not here.
//!
//! Two backends ship with the crate: an in-process map for tests and dev,
//! and a filesystem tree for single-node deployments. Cloud backends (S3,
//! GCS, ...) implement the same trait out of crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Result};

/// Listing entry for one stored blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

/// Key-value blob store with prefix scan, ordered by recency.
///
/// No built-in retry: operations fail fast with a transient error the
/// caller treats as retryable, or NotFound which is not.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `key`, replacing any existing object.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Fetch the bytes stored under `key`. NotFound if absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// List blobs under `prefix`, most recent first, at most `max` entries.
    async fn list(&self, prefix: &str, max: usize) -> Result<Vec<BlobInfo>>;

    /// Remove the blob under `key`. NotFound if absent.
    async fn delete(&self, key: &str) -> Result<()>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    tags: BTreeMap<String, String>,
    last_modified: DateTime<Utc>,
    // Monotonic sequence breaks ties between same-instant writes
    seq: u64,
}

/// In-process blob store for tests and development
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    blobs: BTreeMap<String, StoredBlob>,
    next_seq: u64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs (test helper)
    pub fn len(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.blobs.insert(
            key.to_string(),
            StoredBlob {
                bytes,
                tags,
                last_modified: Utc::now(),
                seq,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .blobs
            .get(key)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| BackupError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str, max: usize) -> Result<Vec<BlobInfo>> {
        let inner = self.inner.lock();
        let mut entries: Vec<(&String, &StoredBlob)> = inner
            .blobs
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();
        entries.sort_by(|a, b| {
            (b.1.last_modified, b.1.seq).cmp(&(a.1.last_modified, a.1.seq))
        });
        Ok(entries
            .into_iter()
            .take(max)
            .map(|(key, blob)| BlobInfo {
                key: key.clone(),
                size: blob.bytes.len() as u64,
                last_modified: blob.last_modified,
                tags: blob.tags.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner
            .lock()
            .blobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackupError::NotFound(key.to_string()))
    }
}

// ============================================================================
// Filesystem backend
// ============================================================================

const SIDECAR_SUFFIX: &str = ".meta.json";

/// Per-object sidecar holding what an object store would keep as metadata
#[derive(Debug, Serialize, Deserialize, Default)]
struct SidecarMeta {
    content_type: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// Filesystem-backed blob store: one file per key plus a JSON sidecar for
/// content-type and tags
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| BackupError::Configuration(format!("cannot create {root:?}: {e}")))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(BackupError::Configuration(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn map_io(key: &str, err: std::io::Error) -> BackupError {
        if err.kind() == std::io::ErrorKind::NotFound {
            BackupError::NotFound(key.to_string())
        } else {
            BackupError::transient_blob(format!("{key}: {err}"))
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackupError::transient_blob(format!("{key}: {e}")))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| BackupError::transient_blob(format!("{key}: {e}")))?;

        let meta = SidecarMeta {
            content_type: content_type.to_string(),
            tags,
        };
        let sidecar = serde_json::to_vec_pretty(&meta)?;
        let sidecar_path = self.root.join(format!("{key}{SIDECAR_SUFFIX}"));
        tokio::fs::write(&sidecar_path, sidecar)
            .await
            .map_err(|e| BackupError::transient_blob(format!("{key}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_io(key, e))
    }

    async fn list(&self, prefix: &str, max: usize) -> Result<Vec<BlobInfo>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let mut entries = tokio::task::spawn_blocking(move || -> Result<Vec<BlobInfo>> {
            let mut found = Vec::new();
            for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(&root) {
                    Ok(rel) => rel,
                    Err(_) => continue,
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(SIDECAR_SUFFIX) || !key.starts_with(&prefix) {
                    continue;
                }

                let meta = entry
                    .metadata()
                    .map_err(|e| BackupError::transient_blob(format!("{key}: {e}")))?;
                let modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                let sidecar_path = root.join(format!("{key}{SIDECAR_SUFFIX}"));
                let tags = std::fs::read(&sidecar_path)
                    .ok()
                    .and_then(|b| serde_json::from_slice::<SidecarMeta>(&b).ok())
                    .map(|m| m.tags)
                    .unwrap_or_default();

                found.push(BlobInfo {
                    key,
                    size: meta.len(),
                    last_modified: modified,
                    tags,
                });
            }
            Ok(found)
        })
        .await
        .map_err(|e| BackupError::transient_blob(format!("list task failed: {e}")))??;

        // Most recent first; key order breaks same-instant ties since
        // backup keys embed their timestamp
        entries.sort_by(|a, b| {
            (b.last_modified, b.key.as_str()).cmp(&(a.last_modified, a.key.as_str()))
        });
        entries.truncate(max);
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_io(key, e))?;
        let sidecar = self.root.join(format!("{key}{SIDECAR_SUFFIX}"));
        let _ = tokio::fs::remove_file(&sidecar).await;
        Ok(())
    }
}
