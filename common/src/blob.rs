//! Byte-level durable backend for materialized state.
//!
//! A `BlobStore` maps opaque byte keys to byte values. The default
//! implementation sits on top of the object_store crate, so the same engine
//! code runs against an in-memory store in tests and a local directory in
//! production.

use async_trait::async_trait;
use futures::StreamExt;
use object_store::{
    ObjectStore, PutPayload, local::LocalFileSystem, memory::InMemory, path::Path as ObjectPath,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compression::{CompressionAlgorithm, CompressionBuilder, Compressor};
use crate::error::{CommonError, Result};

/// Async key-value interface over the durable backend.
#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    /// Get a value by key. A missing key is `Ok(None)`.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key. Removing a missing key succeeds.
    async fn delete(&self, key: &[u8]) -> Result<()>;

    async fn contains_key(&self, key: &[u8]) -> Result<bool>;

    /// All keys starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Apply the operations in order. Not atomic.
    async fn batch_write(&self, operations: Vec<BatchOperation>) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    fn stats(&self) -> BlobStoreStats;
}

/// One step of a `batch_write`.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Operation counters of a blob store.
#[derive(Debug, Clone, Default)]
pub struct BlobStoreStats {
    pub read_count: u64,
    pub write_count: u64,
    pub delete_count: u64,
    pub batch_count: u64,
    pub error_count: u64,
    pub bytes_written: u64,
}

/// Where blobs live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BlobBackend {
    /// Process-local memory, lost on drop.
    #[default]
    Memory,
    /// Files under `root_path`. The directory is created if missing.
    LocalFileSystem { root_path: String },
}

/// Builder for creating blob store instances.
#[derive(Debug, Clone, Default)]
pub struct BlobStoreBuilder {
    backend: BlobBackend,
    key_prefix: Option<String>,
    compression: CompressionAlgorithm,
}

impl BlobStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: BlobBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Place every key under a directory prefix of the backend.
    pub fn key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.compression = algorithm;
        self
    }

    pub fn build(self) -> Result<Arc<dyn BlobStore>> {
        let store: Arc<dyn ObjectStore> = match &self.backend {
            BlobBackend::Memory => Arc::new(InMemory::new()),
            BlobBackend::LocalFileSystem { root_path } => {
                std::fs::create_dir_all(root_path).map_err(|e| {
                    CommonError::io_error_with_source(
                        format!("Failed to create blob root {}", root_path),
                        e,
                    )
                })?;
                let fs = LocalFileSystem::new_with_prefix(root_path).map_err(|e| {
                    CommonError::storage_error_with_source(
                        "Failed to create local filesystem blob store",
                        e,
                    )
                })?;
                Arc::new(fs)
            }
        };

        let compressor = match self.compression {
            CompressionAlgorithm::None => None,
            algorithm => Some(CompressionBuilder::with_algorithm(algorithm).build()?),
        };

        Ok(Arc::new(ObjectStoreBlobStore {
            store,
            backend: self.backend,
            key_prefix: self.key_prefix,
            compressor,
            stats: InternalBlobStats::default(),
        }))
    }
}

#[derive(Debug, Default)]
struct InternalBlobStats {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    batches: AtomicU64,
    errors: AtomicU64,
    bytes_written: AtomicU64,
}

impl InternalBlobStats {
    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BlobStoreStats {
        BlobStoreStats {
            read_count: self.reads.load(Ordering::Acquire),
            write_count: self.writes.load(Ordering::Acquire),
            delete_count: self.deletes.load(Ordering::Acquire),
            batch_count: self.batches.load(Ordering::Acquire),
            error_count: self.errors.load(Ordering::Acquire),
            bytes_written: self.bytes_written.load(Ordering::Acquire),
        }
    }
}

struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
    backend: BlobBackend,
    key_prefix: Option<String>,
    compressor: Option<Arc<dyn Compressor>>,
    stats: InternalBlobStats,
}

impl Debug for ObjectStoreBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBlobStore")
            .field("backend", &self.backend)
            .field("key_prefix", &self.key_prefix)
            .field("compressor", &self.compressor)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ObjectStoreBlobStore {
    /// Keys are hex encoded so that arbitrary bytes form a valid path segment.
    fn key_to_path(&self, key: &[u8]) -> ObjectPath {
        let hex_key = hex::encode(key);
        match &self.key_prefix {
            Some(prefix) => ObjectPath::from(format!("{}/{}", prefix, hex_key)),
            None => ObjectPath::from(hex_key),
        }
    }

    fn path_to_key(&self, path: &ObjectPath) -> Option<Vec<u8>> {
        let raw = path.as_ref();
        let hex_key = match &self.key_prefix {
            Some(prefix) => raw.strip_prefix(prefix.as_str())?.strip_prefix('/')?,
            None => raw,
        };
        hex::decode(hex_key).ok()
    }

    fn convert_error(&self, error: object_store::Error) -> CommonError {
        self.stats.record_error();
        CommonError::storage_error_with_source("Object store operation failed", error)
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let path = self.key_to_path(key);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await.map_err(|e| self.convert_error(e))?,
            Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_read();
                return Ok(None);
            }
            Err(e) => return Err(self.convert_error(e)),
        };
        self.stats.record_read();

        match &self.compressor {
            Some(compressor) => compressor.decompress(&bytes).map(Some),
            None => Ok(Some(bytes.to_vec())),
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let body = match &self.compressor {
            Some(compressor) => compressor.compress(value)?,
            None => value.to_vec(),
        };
        let written = body.len();
        self.store
            .put(&self.key_to_path(key), PutPayload::from(body))
            .await
            .map_err(|e| self.convert_error(e))?;
        self.stats.record_write(written);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        match self.store.delete(&self.key_to_path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                self.stats.record_delete();
                Ok(())
            }
            Err(e) => Err(self.convert_error(e)),
        }
    }

    async fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.stats.record_read();
        match self.store.head(&self.key_to_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.convert_error(e)),
        }
    }

    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        // object_store lists by path segment, so list the whole root and
        // filter on the decoded key.
        let root = self.key_prefix.as_ref().map(|p| ObjectPath::from(p.as_str()));
        let mut keys = Vec::new();
        let mut stream = self.store.list(root.as_ref());
        while let Some(entry) = stream.next().await {
            let meta = entry.map_err(|e| self.convert_error(e))?;
            if let Some(key) = self.path_to_key(&meta.location) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        self.stats.record_read();
        Ok(keys)
    }

    async fn batch_write(&self, operations: Vec<BatchOperation>) -> Result<()> {
        for op in operations {
            match op {
                BatchOperation::Put { key, value } => self.put(&key, &value).await?,
                BatchOperation::Delete { key } => self.delete(&key).await?,
            }
        }
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // Puts on object stores are durable once they return.
        Ok(())
    }

    fn stats(&self) -> BlobStoreStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_blob_store_basic_operations() {
        let store = BlobStoreBuilder::new().build().unwrap();

        store.put(b"stage/1", b"payload").await.unwrap();
        assert_eq!(store.get(b"stage/1").await.unwrap(), Some(b"payload".to_vec()));
        assert!(store.contains_key(b"stage/1").await.unwrap());
        assert!(!store.contains_key(b"stage/2").await.unwrap());

        store.delete(b"stage/1").await.unwrap();
        assert_eq!(store.get(b"stage/1").await.unwrap(), None);
        store.delete(b"stage/1").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_filesystem_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let root_path = temp_dir.path().join("blobs").to_string_lossy().to_string();
        let backend = BlobBackend::LocalFileSystem { root_path };

        let store = BlobStoreBuilder::new()
            .backend(backend.clone())
            .compression(CompressionAlgorithm::Lz4)
            .build()
            .unwrap();
        store.put(b"k", b"durable value").await.unwrap();
        store.flush().await.unwrap();
        drop(store);

        let reopened = BlobStoreBuilder::new()
            .backend(backend)
            .compression(CompressionAlgorithm::Zstd)
            .build()
            .unwrap();
        assert_eq!(reopened.get(b"k").await.unwrap(), Some(b"durable value".to_vec()));
    }

    #[tokio::test]
    async fn test_keys_with_partial_prefix() {
        let store = BlobStoreBuilder::new().key_prefix("ns").build().unwrap();
        store.put(b"arrays/a", b"1").await.unwrap();
        store.put(b"arrays/b", b"2").await.unwrap();
        store.put(b"matrices/a", b"3").await.unwrap();

        let mut keys = store.keys_with_prefix(b"arrays/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![b"arrays/a".to_vec(), b"arrays/b".to_vec()]);
    }

    #[tokio::test]
    async fn test_batch_operations_and_stats() {
        let store = BlobStoreBuilder::new().build().unwrap();
        store
            .batch_write(vec![
                BatchOperation::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                BatchOperation::Put {
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                },
                BatchOperation::Delete { key: b"a".to_vec() },
            ])
            .await
            .unwrap();

        assert_eq!(store.get(b"a").await.unwrap(), None);
        assert_eq!(store.get(b"b").await.unwrap(), Some(b"2".to_vec()));

        let stats = store.stats();
        assert_eq!(stats.write_count, 2);
        assert_eq!(stats.delete_count, 1);
        assert_eq!(stats.batch_count, 1);
    }
}
