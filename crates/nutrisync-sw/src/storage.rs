//! Cache storage backends.
//!
//! A [`CacheStore`] holds named generations, each a map from [`CacheKey`] to
//! [`CacheEntry`]. Writes are atomic per entry; there are no multi-key
//! transactions, and the last completed write to a key wins.

use futures::future::BoxFuture;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::cache::{CacheEntry, CacheKey};

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid generation name: {0}")]
    InvalidName(String),
}

/// Process-wide storage of cache generations.
pub trait CacheStore: Send + Sync {
    /// Names of all existing generations.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, StorageError>>;

    /// Whether generation `name` exists.
    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Create generation `name` if missing.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Store `entry` under `key`, creating the generation if needed.
    fn put<'a>(
        &'a self,
        name: &'a str,
        key: &'a CacheKey,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Look up `key` in generation `name`.
    fn get<'a>(
        &'a self,
        name: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, StorageError>>;

    /// All entries of generation `name` (empty when missing).
    fn entries<'a>(&'a self, name: &'a str)
        -> BoxFuture<'a, Result<Vec<CacheEntry>, StorageError>>;

    /// Delete generation `name`. Returns whether it existed.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, StorageError>>;
}

/// Check that `name` can be used as a generation name by every backend.
///
/// Names are non-empty ASCII alphanumerics, `-`, `_` and `.`, and must not
/// start with a dot.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

// ==================== Memory ====================

type Generation = HashMap<String, CacheEntry>;

/// In-memory store; lives as long as the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    generations: Arc<RwLock<HashMap<String, Generation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, StorageError>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.generations.read().await.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move { Ok(self.generations.read().await.contains_key(name)) })
    }

    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.generations
                .write()
                .await
                .entry(name.to_string())
                .or_default();
            Ok(())
        })
    }

    fn put<'a>(
        &'a self,
        name: &'a str,
        key: &'a CacheKey,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.generations
                .write()
                .await
                .entry(name.to_string())
                .or_default()
                .insert(key.to_string(), entry);
            trace!(generation = name, key = %key, "Stored entry in memory");
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        name: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, StorageError>> {
        Box::pin(async move {
            Ok(self
                .generations
                .read()
                .await
                .get(name)
                .and_then(|g| g.get(&key.to_string()))
                .cloned())
        })
    }

    fn entries<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<CacheEntry>, StorageError>> {
        Box::pin(async move {
            Ok(self
                .generations
                .read()
                .await
                .get(name)
                .map(|g| g.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move { Ok(self.generations.write().await.remove(name).is_some()) })
    }
}

// ==================== Disk ====================

/// On-disk layout of one generation.
#[derive(Debug, Default, Serialize, Deserialize)]
struct GenerationFile {
    entries: HashMap<String, CacheEntry>,
}

/// Store persisted as one JSON file per generation under a directory.
///
/// Every write replaces the file through a temp file and a rename, so a
/// reader sees either the old or the new generation, never a torn one.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DiskStore {
    /// Open (and create) the store rooted at `root`.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened disk cache store");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.root.join(format!("{name}.json")))
    }

    async fn read_generation(&self, path: &Path) -> Result<Option<GenerationFile>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_generation(&self, path: &Path, file: &GenerationFile) -> Result<(), StorageError> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(file)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl CacheStore for DiskStore {
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, StorageError>> {
        Box::pin(async move {
            let mut names = Vec::new();
            let mut dir = tokio::fs::read_dir(&self.root).await?;
            while let Some(item) = dir.next_entry().await? {
                let path = item.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match path.file_stem().and_then(|s| s.to_str()) {
                    Some(stem) if validate_name(stem).is_ok() => names.push(stem.to_string()),
                    _ => debug!(path = %path.display(), "Skipping foreign file in cache dir"),
                }
            }
            names.sort();
            Ok(names)
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move { Ok(tokio::fs::try_exists(self.path_for(name)?).await?) })
    }

    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            let _guard = self.lock.lock().await;
            if !tokio::fs::try_exists(&path).await? {
                self.write_generation(&path, &GenerationFile::default())
                    .await?;
            }
            Ok(())
        })
    }

    fn put<'a>(
        &'a self,
        name: &'a str,
        key: &'a CacheKey,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            let _guard = self.lock.lock().await;
            let mut file = self.read_generation(&path).await?.unwrap_or_default();
            file.entries.insert(key.to_string(), entry);
            self.write_generation(&path, &file).await?;
            trace!(generation = name, key = %key, "Stored entry on disk");
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        name: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, StorageError>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            let _guard = self.lock.lock().await;
            Ok(self
                .read_generation(&path)
                .await?
                .and_then(|mut f| f.entries.remove(&key.to_string())))
        })
    }

    fn entries<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<CacheEntry>, StorageError>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            let _guard = self.lock.lock().await;
            Ok(self
                .read_generation(&path)
                .await?
                .map(|f| f.entries.into_values().collect())
                .unwrap_or_default())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            let _guard = self.lock.lock().await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }
}
