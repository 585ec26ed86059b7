use std::{fmt, sync::Arc};

use async_trait::async_trait;
use moka::future::Cache;

use crate::entry::StoredRecord;
use crate::error::{StorageError, StorageResult};
use crate::storage::CacheStorage;

/// Implements [`CacheStorage`] with [`moka`](https://github.com/moka-rs/moka)
/// as the in-memory backend.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
#[derive(Clone)]
pub struct MokaManager {
    /// The instance of `moka::future::Cache`
    pub cache: Arc<Cache<String, Arc<Vec<u8>>>>,
}

impl fmt::Debug for MokaManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MokaManager").finish_non_exhaustive()
    }
}

impl Default for MokaManager {
    fn default() -> Self {
        Self::new(Cache::new(1024))
    }
}

impl MokaManager {
    /// Create a new manager from a pre-configured Cache
    pub fn new(cache: Cache<String, Arc<Vec<u8>>>) -> Self {
        Self { cache: Arc::new(cache) }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl CacheStorage for MokaManager {
    async fn get(&self, key: &str) -> StorageResult<Option<StoredRecord>> {
        match self.cache.get(key).await {
            Some(bytes) => {
                let record =
                    postcard::from_bytes(&bytes).map_err(StorageError::corrupt)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: String, record: StoredRecord) -> StorageResult<()> {
        let bytes = postcard::to_allocvec(&record).map_err(StorageError::corrupt)?;
        self.cache.insert(key, Arc::new(bytes)).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.cache.invalidate(key).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}
