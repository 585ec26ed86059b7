use std::path::PathBuf;

use async_trait::async_trait;

use crate::entry::StoredRecord;
use crate::error::{StorageError, StorageResult};
use crate::storage::CacheStorage;

/// Implements [`CacheStorage`] with [`cacache`](https://github.com/zkat/cacache-rs)
/// as the disk backend.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-cacache")))]
#[derive(Debug, Clone)]
pub struct CACacheManager {
    /// Directory where the cache will be stored.
    pub path: PathBuf,
}

impl Default for CACacheManager {
    fn default() -> Self {
        Self { path: "./http-cacache".into() }
    }
}

impl CACacheManager {
    /// Create a new manager storing under `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) -> StorageResult<()> {
        cacache::clear(&self.path).await.map_err(StorageError::unavailable)
    }
}

#[async_trait]
impl CacheStorage for CACacheManager {
    async fn get(&self, key: &str) -> StorageResult<Option<StoredRecord>> {
        match cacache::read(&self.path, key).await {
            Ok(bytes) => {
                let record =
                    postcard::from_bytes(&bytes).map_err(StorageError::corrupt)?;
                Ok(Some(record))
            }
            Err(cacache::Error::EntryNotFound(..)) => Ok(None),
            Err(err) => Err(StorageError::unavailable(err)),
        }
    }

    async fn put(&self, key: String, record: StoredRecord) -> StorageResult<()> {
        let bytes = postcard::to_allocvec(&record).map_err(StorageError::corrupt)?;
        cacache::write(&self.path, key, bytes)
            .await
            .map(|_| ())
            .map_err(StorageError::unavailable)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        match cacache::remove(&self.path, key).await {
            Ok(()) => Ok(()),
            Err(cacache::Error::EntryNotFound(..)) => Ok(()),
            Err(err) => Err(StorageError::unavailable(err)),
        }
    }
}
