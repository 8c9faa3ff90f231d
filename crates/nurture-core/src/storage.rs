//! Durable string-keyed JSON storage.
//!
//! The dispatch core persists three documents (queue, rate-limit state,
//! conversation contexts), each under one fixed key. Storage is reached
//! through the [`KvStore`] trait; no transactions are assumed, so each
//! component serializes its own read-modify-write cycles.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`] for tests and ephemeral runs
//! - [`FileStore`], one `<key>.json` file per key, written via temp file + rename
//!
//! Components load their documents with [`load_json_or_discard`]: a document
//! that no longer deserializes is set aside under `<key>.corrupt` and the
//! component starts from an empty one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::BoxFuture;

/// Errors from storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("storage I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to (de)serialize value for key '{key}': {source}")]
    Serde {
        key: String,
        source: serde_json::Error,
    },
}

/// Durable key/value store holding JSON documents.
pub trait KvStore: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    /// All keys currently stored, sorted.
    fn list_keys(&self) -> BoxFuture<'_, Result<Vec<String>, StorageError>>;
}

/// Read and deserialize a typed document.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StorageError::Serde {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Suffix of the key a discarded document is copied to.
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// Like [`load_json`], but an unreadable document is treated as absent.
///
/// When the stored value is valid JSON of the wrong shape it is copied to
/// `<key>.corrupt` first. Backend failures other than decoding still
/// propagate.
pub async fn load_json_or_discard<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let value = match store.get(key).await {
        Ok(Some(value)) => value,
        Ok(None) => return Ok(None),
        Err(StorageError::Serde { source, .. }) => {
            error!(key, error = %source, "stored document is not valid JSON, starting empty");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    match serde_json::from_value::<T>(value.clone()) {
        Ok(doc) => Ok(Some(doc)),
        Err(source) => {
            error!(key, error = %source, "stored document has an unexpected shape, starting empty");
            let backup = format!("{key}{CORRUPT_SUFFIX}");
            if let Err(e) = store.set(&backup, value).await {
                warn!(key = %backup, error = %e, "failed to set discarded document aside");
            }
            Ok(None)
        }
    }
}

/// Serialize and write a typed document.
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let value = serde_json::to_value(value).map_err(|source| StorageError::Serde {
        key: key.to_string(),
        source,
    })?;
    store.set(key, value).await
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

// ── In-memory backend ───────────────────────────────────────────────────

/// Non-durable store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        Box::pin(async move {
            validate_key(key)?;
            Ok(self.entries().get(key).cloned())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            validate_key(key)?;
            self.entries().insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            validate_key(key)?;
            self.entries().remove(key);
            Ok(())
        })
    }

    fn list_keys(&self) -> BoxFuture<'_, Result<Vec<String>, StorageError>> {
        Box::pin(async move { Ok(self.entries().keys().cloned().collect()) })
    }
}

// ── File backend ────────────────────────────────────────────────────────

/// Durable store writing one JSON file per key under a directory.
///
/// Writes go to `<key>.json.tmp`, are synced, and then renamed over the
/// target, so neither a reader nor a crash leaves a half-written document.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StorageError::Io {
                path: root.clone(),
                source,
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KvStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>, StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(StorageError::Io { path, source }),
            };
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StorageError::Serde {
                    key: key.to_string(),
                    source,
                })
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let bytes = serde_json::to_vec(&value).map_err(|source| StorageError::Serde {
                key: key.to_string(),
                source,
            })?;

            let tmp = path.with_extension("json.tmp");
            let tmp_err = |source: std::io::Error| StorageError::Io {
                path: tmp.clone(),
                source,
            };
            let mut file = tokio::fs::File::create(&tmp).await.map_err(tmp_err)?;
            file.write_all(&bytes).await.map_err(tmp_err)?;
            // Data must be on disk before the rename makes it visible.
            file.sync_all().await.map_err(tmp_err)?;
            drop(file);

            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|source| StorageError::Io {
                    path: path.clone(),
                    source,
                })?;

            debug!(key, bytes = bytes.len(), "stored document");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StorageError::Io { path, source }),
            }
        })
    }

    fn list_keys(&self) -> BoxFuture<'_, Result<Vec<String>, StorageError>> {
        Box::pin(async move {
            let io_err = |source| StorageError::Io {
                path: self.root.clone(),
                source,
            };
            let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
            let mut keys = Vec::new();
            while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
                let name = entry.file_name();
                if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                    keys.push(key.to_string());
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}
