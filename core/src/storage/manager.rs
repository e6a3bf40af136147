//! Registry of named storages sharing one durable backend.

use super::Storage;
use crate::traits::{EngineError, EngineResult};
use partflow_common::{BatchOperation, BlobStore, BlobStoreStats};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

fn validate_name(name: &str) -> EngineResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(EngineError::invalid_argument(format!(
            "invalid storage name {:?}: must be non-empty and contain no '/'",
            name
        )));
    }
    Ok(())
}

/// Creates, looks up and checkpoints `Storage` instances.
///
/// Handed to `save_on_storage_manager` callbacks, so it is shared between
/// worker threads.
pub struct StorageManager {
    blobs: Arc<dyn BlobStore>,
    storages: RwLock<HashMap<String, Arc<Storage>>>,
    /// Storages removed since the last `flush_all`; their blobs are purged then.
    pending_purges: Mutex<Vec<String>>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("blobs", &self.blobs)
            .field("storages", &self.storage_names())
            .finish()
    }
}

impl StorageManager {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            storages: RwLock::new(HashMap::new()),
            pending_purges: Mutex::new(Vec::new()),
        }
    }

    pub fn blob_stats(&self) -> BlobStoreStats {
        self.blobs.stats()
    }

    /// Take `name` off the purge list, returning true if it was there.
    fn take_purge(&self, name: &str) -> bool {
        let mut purges = self.pending_purges.lock().unwrap_or_else(PoisonError::into_inner);
        let before = purges.len();
        purges.retain(|purge| purge != name);
        purges.len() != before
    }

    fn is_pending_purge(&self, name: &str) -> bool {
        self.pending_purges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|purge| purge == name)
    }

    /// Return the storage called `name`, creating it when absent.
    ///
    /// A storage re-created after `remove_storage` starts empty and deletes
    /// the removed storage's blobs in its own next flush.
    pub fn create_storage(&self, name: &str) -> EngineResult<Arc<Storage>> {
        validate_name(name)?;
        let mut storages = self.storages.write().unwrap_or_else(PoisonError::into_inner);
        let storage = storages.entry(name.to_string()).or_insert_with(|| {
            let blobs = Arc::clone(&self.blobs);
            if self.take_purge(name) {
                debug!("Re-creating removed storage {}", name);
                Arc::new(Storage::replacing(name, blobs))
            } else {
                debug!("Creating storage {}", name);
                Arc::new(Storage::new(name, blobs))
            }
        });
        Ok(Arc::clone(storage))
    }

    pub fn get_storage(&self, name: &str) -> Option<Arc<Storage>> {
        self.storages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains_storage(&self, name: &str) -> bool {
        self.storages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Forget a storage. Its durable state is deleted by the next `flush_all`.
    pub fn remove_storage(&self, name: &str) -> bool {
        let removed = self
            .storages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            self.pending_purges
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(name.to_string());
        }
        removed
    }

    pub fn storage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .storages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Register the last flushed state of `name`, or return the registered
    /// instance if it is already open.
    ///
    /// A removed storage cannot be reopened, even before `flush_all` has
    /// purged it.
    pub async fn open_storage(&self, name: &str) -> EngineResult<Arc<Storage>> {
        validate_name(name)?;
        if let Some(storage) = self.get_storage(name) {
            return Ok(storage);
        }
        if self.is_pending_purge(name) {
            return Err(EngineError::invalid_argument(format!(
                "storage {} was removed",
                name
            )));
        }
        let opened = Arc::new(Storage::open(name, Arc::clone(&self.blobs)).await?);

        let mut storages = self.storages.write().unwrap_or_else(PoisonError::into_inner);
        let storage = storages.entry(name.to_string()).or_insert(opened);
        Ok(Arc::clone(storage))
    }

    async fn purge(&self, name: &str) -> EngineResult<()> {
        let keys = self
            .blobs
            .keys_with_prefix(&Storage::key_prefix(name))
            .await?;
        let count = keys.len();
        let operations = keys
            .into_iter()
            .map(|key| BatchOperation::Delete { key })
            .collect();
        self.blobs.batch_write(operations).await?;
        debug!("Purged {} blobs of removed storage {}", count, name);
        Ok(())
    }

    /// Purge removed storages, then flush every registered one.
    ///
    /// Returns the total number of structures written.
    pub async fn flush_all(&self) -> EngineResult<usize> {
        let purges: Vec<String> = self
            .pending_purges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for name in &purges {
            // Re-created meanwhile: the new storage deletes the old blobs itself.
            if self.is_pending_purge(name) {
                self.purge(name).await?;
                self.take_purge(name);
            }
        }

        let storages: Vec<Arc<Storage>> = self
            .storages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut written = 0;
        for storage in storages {
            written += storage.flush_data().await?;
        }
        info!(
            "Flushed {} structures, purged {} storages",
            written,
            purges.len()
        );
        Ok(written)
    }
}
