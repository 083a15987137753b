//! On-disk audio blob store.
//!
//! Blobs live flat under `{dir}/{file_name}`.  The key is the remote file's
//! base name only, so two remote files with the same name in different
//! directories (or repositories) share one entry and the later write wins.
//! Presence on disk is the only source of truth; there is no manifest.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::CacheConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),
    #[error("{0} is not cached")]
    NotFound(String),
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// File-name keyed blob store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self::at(config.dir.clone())
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the on-disk path for `file_name` after validating the key.
    pub fn path_for(&self, file_name: &str) -> Result<PathBuf, CacheError> {
        validate_key(file_name)?;
        Ok(self.dir.join(file_name))
    }

    /// `true` iff a blob for `file_name` exists locally.
    pub async fn has(&self, file_name: &str) -> bool {
        match self.path_for(file_name) {
            Ok(path) => tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read the whole blob for `file_name`.
    pub async fn read(&self, file_name: &str) -> Result<Bytes, CacheError> {
        let path = self.path_for(file_name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(file_name.to_string()))
            }
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Create or overwrite the blob for `file_name`.
    ///
    /// The data is written to a temporary sibling and renamed into place, so
    /// readers see either the old blob or the complete new one.
    pub async fn write(&self, file_name: &str, data: &[u8]) -> Result<PathBuf, CacheError> {
        let path = self.path_for(file_name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .dir
            .join(format!(".{file_name}.{}-{seq}.partial", std::process::id()));
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| CacheError::io(&tmp_path, e))?;
        if let Err(e) = write_all_and_flush(&mut file, data).await {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CacheError::io(&tmp_path, e));
        }
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| CacheError::io(&path, e))?;

        debug!(path = %path.display(), bytes = data.len(), "cached blob written");
        Ok(path)
    }
}

/// Distinguishes temp files of concurrent writers of the same key.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

async fn write_all_and_flush(file: &mut tokio::fs::File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}

/// Reject keys that would escape the cache directory or collide with the
/// temporary files used by [`CacheStore::write`].
fn validate_key(file_name: &str) -> Result<(), CacheError> {
    let invalid = file_name.is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\', '\0'])
        || (file_name.starts_with('.') && file_name.ends_with(".partial"));
    if invalid {
        return Err(CacheError::InvalidKey(file_name.to_string()));
    }
    Ok(())
}
