//! The registry of current cache generations.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey};
use crate::config::GatewayConfig;
use crate::storage::{CacheStore, StorageError};

/// Kind of cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
    /// Immutable application shell, populated at install.
    Static,
    /// Runtime-captured responses, populated on demand.
    Dynamic,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Static => "static",
            GenerationKind::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to one named generation in a shared store.
#[derive(Clone)]
pub struct Generation {
    kind: GenerationKind,
    name: String,
    store: Arc<dyn CacheStore>,
}

impl Generation {
    pub fn kind(&self) -> GenerationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        self.store.get(&self.name, key).await
    }

    pub async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), StorageError> {
        self.store.put(&self.name, key, entry).await
    }

    pub async fn exists(&self) -> Result<bool, StorageError> {
        self.store.has(&self.name).await
    }

    pub async fn delete(&self) -> Result<bool, StorageError> {
        self.store.delete(&self.name).await
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The two current generations of one worker version.
///
/// Lookups only ever consult these two; anything else in the store is stale.
#[derive(Debug, Clone)]
pub struct GenerationRegistry {
    static_gen: Generation,
    dynamic_gen: Generation,
}

impl GenerationRegistry {
    pub fn new(config: &GatewayConfig, store: Arc<dyn CacheStore>) -> Self {
        let handle = |kind| Generation {
            kind,
            name: config.generation_name(kind),
            store: Arc::clone(&store),
        };
        Self {
            static_gen: handle(GenerationKind::Static),
            dynamic_gen: handle(GenerationKind::Dynamic),
        }
    }

    pub fn generation(&self, kind: GenerationKind) -> &Generation {
        match kind {
            GenerationKind::Static => &self.static_gen,
            GenerationKind::Dynamic => &self.dynamic_gen,
        }
    }

    /// Whether `name` is one of the current generation names.
    pub fn is_current(&self, name: &str) -> bool {
        name == self.static_gen.name || name == self.dynamic_gen.name
    }

    /// Look `key` up in the static generation, then the dynamic one.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        for generation in [&self.static_gen, &self.dynamic_gen] {
            if let Some(entry) = generation.get(key).await? {
                debug!(key = %key, generation = %generation.name, "Cache hit");
                return Ok(Some(entry));
            }
        }
        debug!(key = %key, "Cache miss");
        Ok(None)
    }

    /// Delete every generation in the store that is not current.
    ///
    /// Every stale name is attempted. Returns the deleted names, or the first
    /// failure once all deletes have finished.
    pub async fn sweep(&self) -> Result<Vec<String>, StorageError> {
        let store = &self.static_gen.store;
        let stale: Vec<String> = store
            .keys()
            .await?
            .into_iter()
            .filter(|name| !self.is_current(name))
            .collect();

        let results =
            futures::future::join_all(stale.iter().map(|name| store.delete(name))).await;
        let mut deleted = Vec::with_capacity(stale.len());
        let mut first_error = None;
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    info!(generation = %name, "Deleted stale cache generation");
                    deleted.push(name);
                }
                Err(e) => {
                    warn!(generation = %name, error = %e, "Could not delete stale cache generation");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::FaultyStore;
    use crate::storage::MemoryStore;
    use url::Url;

    fn entry(url: &Url, body: &[u8]) -> CacheEntry {
        CacheEntry {
            method: "GET".to_string(),
            url: url.clone(),
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
            cached_at: 0,
        }
    }

    #[tokio::test]
    async fn test_lookup_prefers_static() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let registry = GenerationRegistry::new(&GatewayConfig::default(), store);
        let url = Url::parse("http://localhost:5173/index.html").unwrap();
        let key = CacheKey::get(&url);

        registry
            .generation(GenerationKind::Dynamic)
            .put(&key, entry(&url, b"dynamic"))
            .await
            .unwrap();
        assert_eq!(registry.lookup(&key).await.unwrap().unwrap().body, b"dynamic");

        registry
            .generation(GenerationKind::Static)
            .put(&key, entry(&url, b"static"))
            .await
            .unwrap();
        assert_eq!(registry.lookup(&key).await.unwrap().unwrap().body, b"static");
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        for name in ["nutrisync-static-v1", "nutrisync-dynamic-v1", "nutrisync-v1", "nutrisync-static-v2"] {
            store.open(name).await.unwrap();
        }

        let v2 = GatewayConfig::default().with_version("v2");
        let registry = GenerationRegistry::new(&v2, Arc::clone(&store));
        let mut deleted = registry.sweep().await.unwrap();
        deleted.sort();

        assert_eq!(
            deleted,
            vec!["nutrisync-dynamic-v1", "nutrisync-static-v1", "nutrisync-v1"]
        );
        assert_eq!(store.keys().await.unwrap(), vec!["nutrisync-static-v2".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_ignores_stale_generation() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let url = Url::parse("http://localhost:5173/api/suggest").unwrap();
        let key = CacheKey::get(&url);
        store.put("nutrisync-dynamic-v1", &key, entry(&url, b"old")).await.unwrap();

        let v2 = GatewayConfig::default().with_version("v2");
        let registry = GenerationRegistry::new(&v2, store);
        assert!(registry.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_attempts_every_stale_name() {
        let store = Arc::new(FaultyStore::new().fail_delete("nutrisync-v0"));
        for name in ["nutrisync-v0", "nutrisync-static-v1", "nutrisync-dynamic-v1"] {
            store.open(name).await.unwrap();
        }

        let v2 = GatewayConfig::default().with_version("v2");
        let registry = GenerationRegistry::new(&v2, store.clone());
        assert!(registry.sweep().await.is_err());
        assert_eq!(store.keys().await.unwrap(), vec!["nutrisync-v0".to_string()]);
    }
}
