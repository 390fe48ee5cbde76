//! Artifact storage gateway.
//!
//! Keys are opaque, slash-separated relative paths minted by `put`. `replace`
//! keeps the key so every stored reference stays valid.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::features::session_store::ExpiringMap;

const READ_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("storage failure for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    fn io(key: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

/// Time-boxed read URL. Not a durability mechanism: reissue after expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

pub trait ArtifactStore: Send + Sync {
    /// Store new bytes and mint a key. `hint` is usually the original file name.
    fn put(&self, bytes: &[u8], hint: &str) -> Result<String, StorageError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Overwrite in place. Readers see either the old or the new object,
    /// never a partial one. Returns the unchanged key.
    fn replace(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn issue_access_url(&self, key: &str, ttl: Duration) -> Result<AccessUrl, StorageError>;
}

/// Delete whose failure is logged and swallowed.
pub fn delete_best_effort(store: &dyn ArtifactStore, key: &str) -> bool {
    match store.delete(key) {
        Ok(()) => true,
        Err(e) => {
            warn!(key, error = %e, "artifact delete failed; continuing");
            false
        }
    }
}

/// Filesystem-backed store with a short-lived read cache.
pub struct FsArtifactStore {
    root: PathBuf,
    url_base: String,
    secret: String,
    cache: Mutex<ExpiringMap<String, Arc<Vec<u8>>>>,
}

impl std::fmt::Debug for FsArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsArtifactStore")
            .field("root", &self.root)
            .field("url_base", &self.url_base)
            .finish()
    }
}

impl FsArtifactStore {
    pub fn open(root: impl Into<PathBuf>, url_base: &str, secret: &str) -> Result<Self, StorageError> {
        if secret.trim().is_empty() {
            return Err(StorageError::Unavailable("access url secret is empty".into()));
        }
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::io(&root.to_string_lossy(), e))?;
        Ok(Self {
            root,
            url_base: url_base.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
            cache: Mutex::new(ExpiringMap::new(READ_CACHE_TTL)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && !key.contains('\\')
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn evict(&self, key: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.remove(&key.to_string());
    }

    /// Write to a sibling temp file, fsync, then rename over the target.
    fn write_atomic(&self, key: &str, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(dir).map_err(|e| StorageError::io(key, e))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StorageError::io(key, e))?;
        tmp.write_all(bytes).map_err(|e| StorageError::io(key, e))?;
        tmp.as_file().sync_all().map_err(|e| StorageError::io(key, e))?;
        tmp.persist(path).map_err(|e| StorageError::io(key, e.error))?;
        Ok(())
    }

    pub fn issue_access_url_at(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<AccessUrl, StorageError> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let expires_at = now + ttl;
        let expires = expires_at.timestamp();
        Ok(AccessUrl {
            url: format!(
                "{}/{}?expires={}&token={}",
                self.url_base,
                key,
                expires,
                self.token(key, expires)
            ),
            expires_at,
        })
    }

    /// True when the URL was issued by this store and has not expired.
    pub fn verify_access_url(&self, url: &str, now: DateTime<Utc>) -> bool {
        let Some(rest) = url.strip_prefix(&format!("{}/", self.url_base)) else {
            return false;
        };
        let Some((key, query)) = rest.split_once('?') else {
            return false;
        };
        let mut expires: Option<i64> = None;
        let mut token: Option<&str> = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse().ok(),
                Some(("token", v)) => token = Some(v),
                _ => {}
            }
        }
        match (expires, token) {
            (Some(expires), Some(token)) if expires > now.timestamp() => {
                let Ok(presented) = URL_SAFE_NO_PAD.decode(token) else {
                    return false;
                };
                bool::from(presented.as_slice().ct_eq(self.digest(key, expires).as_slice()))
            }
            _ => false,
        }
    }

    fn digest(&self, key: &str, expires: i64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        hasher.finalize().into()
    }

    fn token(&self, key: &str, expires: i64) -> String {
        URL_SAFE_NO_PAD.encode(self.digest(key, expires))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, bytes: &[u8], hint: &str) -> Result<String, StorageError> {
        let key = format!(
            "documents/{}/{}-{}",
            Utc::now().format("%Y%m"),
            Uuid::new_v4(),
            sanitize_hint(hint)
        );
        let path = self.path_for(&key)?;
        self.write_atomic(&key, &path, bytes)?;
        debug!(key = %key, size = bytes.len(), "artifact stored");
        Ok(key)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(hit) = cache.get(&key.to_string()) {
                return Ok(hit.to_vec());
            }
        }
        let path = self.path_for(key)?;
        let bytes = fs::read(&path).map_err(|e| StorageError::io(key, e))?;
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(key.to_string(), Arc::new(bytes.clone()));
        Ok(bytes)
    }

    fn replace(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        self.write_atomic(key, &path, bytes)?;
        self.evict(key);
        debug!(key, size = bytes.len(), "artifact replaced");
        Ok(key.to_string())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        self.evict(key);
        fs::remove_file(&path).map_err(|e| StorageError::io(key, e))?;
        debug!(key, "artifact deleted");
        Ok(())
    }

    fn issue_access_url(&self, key: &str, ttl: Duration) -> Result<AccessUrl, StorageError> {
        self.issue_access_url_at(key, ttl, Utc::now())
    }
}

fn sanitize_hint(hint: &str) -> String {
    let name = Path::new(hint)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "artifact.pdf".to_string()
    } else {
        cleaned
    }
}
