//! Partition cache for stages marked with `cache(..)`.

use super::CacheType;
use crate::storage::structures::encode_bincode;
use crate::storage::{DataStream, Storage};
use crate::traits::{Data, EngineError, EngineResult, Partition, StageId};
use partflow_common::{Cache, CacheBuilder, CacheStats};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

type Materialized = Arc<dyn Any + Send + Sync>;

/// Counters of a `CacheManager`.
#[derive(Debug, Clone, Default)]
pub struct CacheManagerStats {
    pub hits: u64,
    pub misses: u64,
    pub stored: u64,
    pub memory: CacheStats,
}

/// Keeps materialized stage partitions in a bounded memory cache and/or in
/// data streams of the engine's cache storage.
pub struct CacheManager {
    memory: Arc<dyn Cache<StageId, Materialized>>,
    storage: Arc<Storage>,
    /// One lock per stage being filled, so concurrent jobs compute it once.
    fills: Mutex<HashMap<StageId, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stored: AtomicU64,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("storage", &self.storage.name())
            .field("stats", &self.stats())
            .finish()
    }
}

fn stream_name(stage_id: StageId) -> String {
    format!("stage-{}", stage_id)
}

impl CacheManager {
    pub fn new(memory_capacity: u64, storage: Arc<Storage>) -> Self {
        Self {
            memory: CacheBuilder::new().max_capacity(memory_capacity).build(),
            storage,
            fills: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stored: AtomicU64::new(0),
        }
    }

    /// The storage holding `StorageOnly` and `MemoryAndStorage` entries.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn from_memory<T: Data>(&self, stage_id: StageId) -> Option<Arc<Vec<Partition<T>>>> {
        self.memory
            .get(&stage_id)
            .and_then(|any| any.downcast::<Vec<Partition<T>>>().ok())
    }

    fn from_storage<T: Data>(&self, stage_id: StageId) -> EngineResult<Option<Vec<Partition<T>>>> {
        let Some(stream) = self.storage.get_data_stream(&stream_name(stage_id))? else {
            return Ok(None);
        };
        let partitions = stream
            .read_values::<Vec<T>>()?
            .into_iter()
            .enumerate()
            .map(|(index, data)| Partition::new(index, data))
            .collect();
        Ok(Some(partitions))
    }

    /// A storage hit for a policy that also uses memory is promoted to the
    /// memory cache. Misses are not counted here.
    fn lookup<T: Data>(
        &self,
        stage_id: StageId,
        cache_type: CacheType,
    ) -> EngineResult<Option<Arc<Vec<Partition<T>>>>> {
        if cache_type.use_memory() {
            if let Some(partitions) = self.from_memory::<T>(stage_id) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Memory cache hit for stage {}", stage_id);
                return Ok(Some(partitions));
            }
        }

        if cache_type.use_storage() {
            if let Some(partitions) = self.from_storage::<T>(stage_id)? {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Storage cache hit for stage {}", stage_id);
                let partitions = Arc::new(partitions);
                if cache_type.use_memory() {
                    self.memory
                        .put(stage_id, Arc::clone(&partitions) as Materialized);
                }
                return Ok(Some(partitions));
            }
        }
        Ok(None)
    }

    fn record_miss(&self, stage_id: StageId) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss for stage {}", stage_id);
    }

    fn fill_lock(&self, stage_id: StageId) -> Arc<Mutex<()>> {
        let mut fills = self.fills.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(fills.entry(stage_id).or_default())
    }

    /// Cached partitions of `stage_id`, if any were stored under `cache_type`.
    pub fn get<T: Data>(
        &self,
        stage_id: StageId,
        cache_type: CacheType,
    ) -> EngineResult<Option<Arc<Vec<Partition<T>>>>> {
        let found = self.lookup::<T>(stage_id, cache_type)?;
        if found.is_none() {
            self.record_miss(stage_id);
        }
        Ok(found)
    }

    /// Cached partitions of `stage_id`, computed with `fill` and stored on a
    /// miss. Concurrent callers for the same stage wait for a single fill
    /// and then share its result.
    pub fn get_or_fill<T, F>(
        &self,
        stage_id: StageId,
        cache_type: CacheType,
        fill: F,
    ) -> EngineResult<Arc<Vec<Partition<T>>>>
    where
        T: Data,
        F: FnOnce() -> EngineResult<Arc<Vec<Partition<T>>>>,
    {
        if let Some(partitions) = self.lookup::<T>(stage_id, cache_type)? {
            return Ok(partitions);
        }

        let lock = self.fill_lock(stage_id);
        let _filling = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(partitions) = self.lookup::<T>(stage_id, cache_type)? {
            return Ok(partitions);
        }
        self.record_miss(stage_id);
        let partitions = fill()?;
        self.put(stage_id, cache_type, &partitions)?;
        Ok(partitions)
    }

    /// Retain `partitions` of `stage_id` according to `cache_type`.
    pub fn put<T: Data>(
        &self,
        stage_id: StageId,
        cache_type: CacheType,
        partitions: &Arc<Vec<Partition<T>>>,
    ) -> EngineResult<()> {
        if !cache_type.is_cached() {
            return Err(EngineError::invalid_argument(format!(
                "stage {} has no cache policy",
                stage_id
            )));
        }

        if cache_type.use_storage() {
            let records = partitions
                .iter()
                .map(|partition| encode_bincode(partition.data()))
                .collect::<EngineResult<Vec<_>>>()?;
            let stream = DataStream::new(&stream_name(stage_id));
            for record in records {
                stream.append(record);
            }
            self.storage.replace_data_stream(stream);
        }

        if cache_type.use_memory() {
            self.memory
                .put(stage_id, Arc::clone(partitions) as Materialized);
        }

        self.stored.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Cached {} partitions of stage {} as {:?}",
            partitions.len(),
            stage_id,
            cache_type
        );
        Ok(())
    }

    /// Drop every cached copy of `stage_id`. Returns true if one existed.
    pub fn evict(&self, stage_id: StageId) -> bool {
        self.fills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stage_id);
        let in_memory = self.memory.remove(&stage_id).is_some();
        let in_storage = self.storage.remove_data_stream(&stream_name(stage_id));
        in_memory || in_storage
    }

    pub fn stats(&self) -> CacheManagerStats {
        CacheManagerStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            memory: self.memory.stats(),
        }
    }
}
