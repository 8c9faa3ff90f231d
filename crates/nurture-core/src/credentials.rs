//! Bearer credential storage for the completion endpoint.
//!
//! The app keeps exactly one API key. It is held in an [`ApiKey`] that is
//! zeroized on drop and redacted in `Debug` output, and is reached through
//! the [`CredentialStore`] trait so the completion client never cares where
//! the key lives.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::info;
use zeroize::Zeroize;

use crate::BoxFuture;

/// A bearer token with automatic zeroization.
#[derive(Clone)]
pub struct ApiKey {
    inner: String,
}

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// The raw token, for building the `Authorization` header only.
    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("inner", &"[REDACTED]")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

/// Errors from credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("API key must not be empty")]
    Empty,

    #[error("failed to access credential file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Secure get/set/delete of the single bearer token.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> BoxFuture<'_, Result<Option<ApiKey>, CredentialError>>;

    fn set(&self, key: ApiKey) -> BoxFuture<'_, Result<(), CredentialError>>;

    fn delete(&self) -> BoxFuture<'_, Result<(), CredentialError>>;
}

/// Process-lifetime credential holder.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    key: Mutex<Option<ApiKey>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// A holder pre-loaded with `key`.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Mutex::new(Some(ApiKey::new(key))),
        }
    }
}

impl CredentialStore for MemoryCredentials {
    fn get(&self) -> BoxFuture<'_, Result<Option<ApiKey>, CredentialError>> {
        Box::pin(async move {
            Ok(self
                .key
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        })
    }

    fn set(&self, key: ApiKey) -> BoxFuture<'_, Result<(), CredentialError>> {
        Box::pin(async move {
            if key.is_empty() {
                return Err(CredentialError::Empty);
            }
            *self.key.lock().unwrap_or_else(PoisonError::into_inner) = Some(key);
            Ok(())
        })
    }

    fn delete(&self) -> BoxFuture<'_, Result<(), CredentialError>> {
        Box::pin(async move {
            *self.key.lock().unwrap_or_else(PoisonError::into_inner) = None;
            Ok(())
        })
    }
}

/// Credential file with owner-only permissions, falling back to an
/// environment variable when the file does not exist.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
    env_var: Option<String>,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_var: None,
        }
    }

    /// Consult `var` when no key file is present.
    pub fn with_env_fallback(mut self, var: impl Into<String>) -> Self {
        self.env_var = Some(var.into());
        self
    }

    fn io_err(&self, source: std::io::Error) -> CredentialError {
        CredentialError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn from_env(&self) -> Option<ApiKey> {
        let var = self.env_var.as_deref()?;
        let key = ApiKey::new(std::env::var(var).ok()?);
        (!key.is_empty()).then_some(key)
    }
}

impl CredentialStore for FileCredentials {
    fn get(&self) -> BoxFuture<'_, Result<Option<ApiKey>, CredentialError>> {
        Box::pin(async move {
            match tokio::fs::read_to_string(&self.path).await {
                Ok(mut raw) => {
                    let key = ApiKey::new(raw.trim());
                    raw.zeroize();
                    Ok((!key.is_empty()).then_some(key))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(self.from_env()),
                Err(e) => Err(self.io_err(e)),
            }
        })
    }

    fn set(&self, key: ApiKey) -> BoxFuture<'_, Result<(), CredentialError>> {
        Box::pin(async move {
            if key.is_empty() {
                return Err(CredentialError::Empty);
            }
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_err(e))?;
            }
            tokio::fs::write(&self.path, key.expose())
                .await
                .map_err(|e| self.io_err(e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                    .await
                    .map_err(|e| self.io_err(e))?;
            }

            info!(path = %self.path.display(), "API key stored");
            Ok(())
        })
    }

    fn delete(&self) -> BoxFuture<'_, Result<(), CredentialError>> {
        Box::pin(async move {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    info!(path = %self.path.display(), "API key removed");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(self.io_err(e)),
            }
        })
    }
}
