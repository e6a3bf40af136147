//! Retention policies for materialized stages.

use serde::{Deserialize, Serialize};

/// Where the partitions of a cached stage are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CacheType {
    /// Recompute on every evaluation
    #[default]
    None,
    /// Keep the partitions in the memory cache
    MemoryOnly,
    /// Serialize into a data stream of the cache storage; durable after the
    /// next flush
    StorageOnly,
    /// Both of the above; memory is checked first
    MemoryAndStorage,
}

impl CacheType {
    pub fn use_memory(&self) -> bool {
        matches!(self, CacheType::MemoryOnly | CacheType::MemoryAndStorage)
    }

    pub fn use_storage(&self) -> bool {
        matches!(self, CacheType::StorageOnly | CacheType::MemoryAndStorage)
    }

    pub fn is_cached(&self) -> bool {
        !matches!(self, CacheType::None)
    }
}
