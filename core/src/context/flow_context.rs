//! FlowContext - entry point of the engine
//!
//! A context owns the worker pool, the storage manager and the stage cache,
//! and creates the source datasets every computation starts from.

use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::dataset::source::{Chunking, SourceStage};
use crate::dataset::stage::StageMeta;
use crate::dataset::{PairPartitionableDataset, PartitionableDataset};
use crate::provider::{
    DataSourceIteratorProvider, IndexedFileLineProvider, IndexedLine, RecursiveFileLineProvider,
    VecProvider,
};
use crate::scheduler::{Placement, Scheduler};
use crate::storage::StorageManager;
use crate::traits::{Data, EngineError, EngineResult, StageId};
use partflow_common::BlobStoreBuilder;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};

struct ContextShared {
    config: EngineConfig,
    scheduler: Scheduler,
    storage_manager: Arc<StorageManager>,
    cache_manager: CacheManager,
    next_stage_id: AtomicUsize,
    stopped: AtomicBool,
}

/// Handle to a running engine. Clones share the same engine.
#[derive(Clone)]
pub struct FlowContext {
    shared: Arc<ContextShared>,
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("app_name", &self.shared.config.app_name)
            .field("num_workers", &self.shared.scheduler.num_workers())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl FlowContext {
    /// Start an engine with `config`.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let blobs = BlobStoreBuilder::new()
            .backend(config.backend.clone())
            .compression(config.compression)
            .build()?;
        let storage_manager = Arc::new(StorageManager::new(blobs));
        let cache_storage = storage_manager.create_storage(&config.cache_storage_name)?;
        let cache_manager = CacheManager::new(config.memory_cache_capacity, cache_storage);
        let scheduler = Scheduler::new(config.num_workers)?;

        info!(
            app_name = %config.app_name,
            num_workers = config.num_workers,
            backend = ?config.backend,
            "Started flow context"
        );
        Ok(Self {
            shared: Arc::new(ContextShared {
                config,
                scheduler,
                storage_manager,
                cache_manager,
                next_stage_id: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Start an engine with default settings.
    pub fn with_app_name(app_name: impl Into<String>) -> EngineResult<Self> {
        Self::new(EngineConfig::new(app_name))
    }

    pub fn app_name(&self) -> &str {
        &self.shared.config.app_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn storage_manager(&self) -> &StorageManager {
        &self.shared.storage_manager
    }

    /// Owned handle to the storage manager, e.g. to flush from async code.
    pub fn storage_manager_handle(&self) -> Arc<StorageManager> {
        Arc::clone(&self.shared.storage_manager)
    }

    pub fn cache_manager(&self) -> &CacheManager {
        &self.shared.cache_manager
    }

    pub(crate) fn next_stage_id(&self) -> StageId {
        self.shared.next_stage_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Refuse further jobs. Datasets may still be built but evaluating them
    /// fails with `IllegalState`.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            info!(app_name = %self.app_name(), "Stopped flow context");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> EngineResult<()> {
        if self.is_stopped() {
            return Err(EngineError::illegal_state(format!(
                "flow context {} is stopped",
                self.app_name()
            )));
        }
        Ok(())
    }

    fn source<T: Data>(
        &self,
        provider: Arc<dyn DataSourceIteratorProvider<T>>,
        chunking: Chunking,
    ) -> EngineResult<PartitionableDataset<T>> {
        let chunking = chunking.validate()?;
        let meta = StageMeta::new(self.next_stage_id(), "source", Placement::default());
        debug!(stage_id = meta.id, ?chunking, "Created source stage");
        Ok(PartitionableDataset::from_stage(
            self.clone(),
            Arc::new(SourceStage::new(meta, provider, chunking)),
        ))
    }

    // Sources

    /// Distribute `data` into partitions of `default_partition_size`
    /// elements.
    pub fn parallelize<T: Data>(&self, data: Vec<T>) -> PartitionableDataset<T> {
        let meta = StageMeta::new(self.next_stage_id(), "source", Placement::default());
        // `default_partition_size` was validated positive by `new`.
        let chunking = Chunking::Size(self.config().default_partition_size);
        PartitionableDataset::from_stage(
            self.clone(),
            Arc::new(SourceStage::new(meta, Arc::new(VecProvider::new(data)), chunking)),
        )
    }

    /// Distribute `data` into exactly `num_partitions` partitions of
    /// near-equal size.
    pub fn parallelize_with_partitions<T: Data>(
        &self,
        data: Vec<T>,
        num_partitions: usize,
    ) -> EngineResult<PartitionableDataset<T>> {
        self.source(Arc::new(VecProvider::new(data)), Chunking::Count(num_partitions))
    }

    pub fn parallelize_pairs<K, V>(&self, data: Vec<(K, V)>) -> PairPartitionableDataset<K, V>
    where
        K: Data + Hash + Eq,
        V: Data,
    {
        PairPartitionableDataset::new(self.parallelize(data))
    }

    /// Read every item of `provider`, `partition_size` items per partition.
    pub fn from_provider<T: Data>(
        &self,
        provider: Arc<dyn DataSourceIteratorProvider<T>>,
        partition_size: usize,
    ) -> EngineResult<PartitionableDataset<T>> {
        self.source(provider, Chunking::Size(partition_size))
    }

    /// Lines of the files below `base_dir` whose name fully matches
    /// `file_name_pattern`, or of every file when it is `None`.
    pub fn text_files(
        &self,
        base_dir: &str,
        file_name_pattern: Option<&str>,
    ) -> EngineResult<PartitionableDataset<String>> {
        let provider = RecursiveFileLineProvider::new(base_dir, file_name_pattern)?;
        self.source(
            Arc::new(provider),
            Chunking::Size(self.config().default_partition_size),
        )
    }

    /// Like `text_files`, with the file name and line index of every line.
    pub fn indexed_text_files(
        &self,
        base_dir: &str,
        file_name_pattern: Option<&str>,
    ) -> EngineResult<PartitionableDataset<IndexedLine>> {
        let provider = IndexedFileLineProvider::new(base_dir, file_name_pattern)?;
        self.source(
            Arc::new(provider),
            Chunking::Size(self.config().default_partition_size),
        )
    }
}
