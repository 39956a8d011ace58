//! Persistent storage behind a repository interface.
//!
//! Every component talks to an [`Repository`] for its record type. Two
//! backends exist:
//!
//! - [`MemoryRepository`] keeps records in process memory (tests, ephemeral runs).
//! - [`FileRepository`] keeps one JSON file per collection under the data
//!   directory and rewrites it atomically (temp file + rename) on every change.
//!
//! Repositories provide no cross-call atomicity. Components that need a
//! read-check-write sequence hold their own write lock around it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{Config, StorageBackend};
use crate::error::{Result, SirenError};

/// A persistable record with a stable primary key.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name, used as the file stem by [`FileRepository`].
    const COLLECTION: &'static str;

    /// Primary key of this record.
    fn key(&self) -> String;
}

/// Keyed storage for one record type.
#[async_trait]
pub trait Repository<V: Record>: Send + Sync {
    /// Fetch a record by key.
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Insert or replace a record.
    async fn put(&self, value: V) -> Result<()>;

    /// Remove a record, returning it if it existed.
    async fn remove(&self, key: &str) -> Result<Option<V>>;

    /// All records, ordered by key.
    async fn list(&self) -> Result<Vec<V>>;
}

/// Shared handle to a repository.
pub type SharedRepository<V> = Arc<dyn Repository<V>>;

// =============================================================================
// MEMORY BACKEND
// =============================================================================

/// In-memory repository.
#[derive(Debug)]
pub struct MemoryRepository<V> {
    records: RwLock<BTreeMap<String, V>>,
}

impl<V> Default for MemoryRepository<V> {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V: Record> MemoryRepository<V> {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty repository behind a shared handle.
    #[must_use]
    pub fn shared() -> SharedRepository<V> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl<V: Record> Repository<V> for MemoryRepository<V> {
    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, value: V) -> Result<()> {
        self.records.write().await.insert(value.key(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<Option<V>> {
        Ok(self.records.write().await.remove(key))
    }

    async fn list(&self) -> Result<Vec<V>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

// =============================================================================
// FILE BACKEND
// =============================================================================

/// JSON-file repository: `<data_dir>/<collection>.json`.
#[derive(Debug)]
pub struct FileRepository<V> {
    path: PathBuf,
    records: RwLock<BTreeMap<String, V>>,
}

impl<V: Record> FileRepository<V> {
    /// Open (or create) the collection file under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or an existing
    /// file cannot be parsed.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await.map_err(|e| {
            SirenError::PersistenceError(format!(
                "Failed to create data directory {}: {e}",
                data_dir.display()
            ))
        })?;

        let path = data_dir.join(format!("{}.json", V::COLLECTION));
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let values: Vec<V> = serde_json::from_str(&content)?;
                values.into_iter().map(|v| (v.key(), v)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(SirenError::PersistenceError(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        tracing::debug!(
            collection = V::COLLECTION,
            path = %path.display(),
            records = records.len(),
            "Opened collection"
        );

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, records: &BTreeMap<String, V>) -> Result<()> {
        let values: Vec<&V> = records.values().collect();
        let content = serde_json::to_string_pretty(&values)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(|e| {
            SirenError::PersistenceError(format!("Failed to write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            SirenError::PersistenceError(format!("Failed to replace {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl<V: Record> Repository<V> for FileRepository<V> {
    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, value: V) -> Result<()> {
        let mut records = self.records.write().await;
        let key = value.key();
        let previous = records.insert(key.clone(), value);
        if let Err(e) = self.flush(&records).await {
            // Keep memory consistent with disk.
            match previous {
                Some(prev) => records.insert(key, prev),
                None => records.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<Option<V>> {
        let mut records = self.records.write().await;
        let Some(removed) = records.remove(key) else {
            return Ok(None);
        };
        if let Err(e) = self.flush(&records).await {
            records.insert(key.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    async fn list(&self) -> Result<Vec<V>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

/// Open a repository for `V` using the configured backend.
///
/// # Errors
///
/// Returns an error if the file backend cannot be opened.
pub async fn open_repository<V: Record>(config: &Config) -> Result<SharedRepository<V>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(MemoryRepository::<V>::shared()),
        StorageBackend::File => {
            let repo = FileRepository::<V>::open(&config.data_dir()).await?;
            Ok(Arc::new(repo))
        }
    }
}
