//! Engine configuration.

use crate::traits::{EngineError, EngineResult};
use partflow_common::{BlobBackend, CompressionAlgorithm};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings of a `FlowContext`.
///
/// Every field has a default, so a JSON document only needs to name the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub app_name: String,
    /// Threads of the dedicated worker pool.
    pub num_workers: usize,
    /// Elements per partition when a source is split by size.
    pub default_partition_size: usize,
    /// Output partitions of keyed shuffles.
    pub shuffle_partitions: usize,
    /// Keys sampled per job to build the range partitioner of `sort_by_key`.
    pub sort_sample_size: usize,
    /// Stages kept in the memory tier of the cache.
    pub memory_cache_capacity: u64,
    /// Storage that receives `StorageOnly` cache streams.
    pub cache_storage_name: String,
    pub backend: BlobBackend,
    pub compression: CompressionAlgorithm,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "partflow-app".to_string(),
            num_workers: num_cpus::get(),
            default_partition_size: 1000,
            shuffle_partitions: num_cpus::get(),
            sort_sample_size: 1000,
            memory_cache_capacity: 1024,
            cache_storage_name: "partflow-cache".to_string(),
            backend: BlobBackend::Memory,
            compression: CompressionAlgorithm::None,
        }
    }
}

impl EngineConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            EngineError::invalid_argument(format!("malformed engine configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_argument(format!(
                "cannot read configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    /// Reject values that would make the engine unusable.
    pub fn validate(&self) -> EngineResult<()> {
        let positive = [
            ("num_workers", self.num_workers),
            ("default_partition_size", self.default_partition_size),
            ("shuffle_partitions", self.shuffle_partitions),
            ("sort_sample_size", self.sort_sample_size),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(EngineError::invalid_argument(format!(
                    "{} must be positive",
                    field
                )));
            }
        }
        if self.cache_storage_name.is_empty() {
            return Err(EngineError::invalid_argument(
                "cache_storage_name must not be empty",
            ));
        }
        Ok(())
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_default_partition_size(mut self, size: usize) -> Self {
        self.default_partition_size = size;
        self
    }

    pub fn with_shuffle_partitions(mut self, partitions: usize) -> Self {
        self.shuffle_partitions = partitions;
        self
    }

    pub fn with_sort_sample_size(mut self, size: usize) -> Self {
        self.sort_sample_size = size;
        self
    }

    pub fn with_memory_cache_capacity(mut self, capacity: u64) -> Self {
        self.memory_cache_capacity = capacity;
        self
    }

    pub fn with_cache_storage_name(mut self, name: impl Into<String>) -> Self {
        self.cache_storage_name = name.into();
        self
    }

    pub fn with_backend(mut self, backend: BlobBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self
    }
}
