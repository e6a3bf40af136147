//! Lazy partitioned datasets.
//!
//! Transformations return new datasets that reference the stage of their
//! receiver; nothing runs until a terminal action (`collect`, `count`, ...)
//! evaluates the chain.

mod cached;
mod narrow;
pub mod pair;
mod rechunk;
mod shuffled;
pub(crate) mod source;
pub mod stage;

pub use pair::PairPartitionableDataset;
pub use stage::StageInfo;

use crate::cache::CacheType;
use crate::context::FlowContext;
use crate::promise::ValuePromise;
use crate::scheduler::job::{compute_partition, partition_count, prepare_stage, run_stage_with};
use crate::scheduler::pool::guard;
use crate::scheduler::{JobRun, Placement, TaskScope};
use crate::shuffle::{FirstAggregator, HashPartitioner};
use crate::storage::StorageManager;
use crate::task::TaskDataContext;
use crate::traits::{Data, EngineResult, StageId};
use cached::CachedStage;
use narrow::{NarrowFn, NarrowStage, NarrowTask, UnionStage};
use rechunk::RechunkStage;
use shuffled::ShuffledStage;
use stage::{Stage, StageMeta};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A lazily evaluated, partitioned collection of `T`.
pub struct PartitionableDataset<T: Data> {
    ctx: FlowContext,
    stage: Arc<dyn Stage<T>>,
    local: bool,
}

impl<T: Data> Clone for PartitionableDataset<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            stage: Arc::clone(&self.stage),
            local: self.local,
        }
    }
}

impl<T: Data> std::fmt::Debug for PartitionableDataset<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionableDataset")
            .field("stage_id", &self.stage.id())
            .field("operator", &self.stage.operator())
            .field("local", &self.local)
            .finish()
    }
}

impl<T: Data> PartitionableDataset<T> {
    pub(crate) fn from_stage(ctx: FlowContext, stage: Arc<dyn Stage<T>>) -> Self {
        Self {
            ctx,
            stage,
            local: false,
        }
    }

    pub fn context(&self) -> &FlowContext {
        &self.ctx
    }

    /// Id of the stage producing this dataset.
    pub fn id(&self) -> StageId {
        self.stage.id()
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub(crate) fn stage(&self) -> &Arc<dyn Stage<T>> {
        &self.stage
    }

    pub(crate) fn meta(&self, operator: &'static str) -> StageMeta {
        StageMeta::new(
            self.ctx.next_stage_id(),
            operator,
            Placement::from_local_flag(self.local),
        )
    }

    pub(crate) fn derive<U: Data>(&self, stage: Arc<dyn Stage<U>>) -> PartitionableDataset<U> {
        PartitionableDataset {
            ctx: self.ctx.clone(),
            stage,
            local: self.local,
        }
    }

    pub(crate) fn narrow<U, F>(&self, operator: &'static str, f: F) -> PartitionableDataset<U>
    where
        U: Data,
        F: Fn(&NarrowTask<'_>, Vec<T>) -> EngineResult<Vec<U>> + Send + Sync + 'static,
    {
        let f: NarrowFn<T, U> = Arc::new(f);
        let stage = NarrowStage::new(self.meta(operator), Arc::clone(&self.stage), f);
        self.derive::<U>(Arc::new(stage))
    }

    // Transformations

    pub fn map<U, F>(&self, f: F) -> PartitionableDataset<U>
    where
        U: Data,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.narrow("map", move |_, data| Ok(data.into_iter().map(&f).collect()))
    }

    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.narrow(
            "filter",
            move |_, data| Ok(data.into_iter().filter(|x| predicate(x)).collect()),
        )
    }

    pub fn flat_map<U, I, F>(&self, f: F) -> PartitionableDataset<U>
    where
        U: Data,
        I: IntoIterator<Item = U>,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        self.narrow(
            "flat_map",
            move |_, data| Ok(data.into_iter().flat_map(&f).collect()),
        )
    }

    /// Apply `f` to the elements of each partition as a whole.
    pub fn map_partitions<U, F>(&self, f: F) -> PartitionableDataset<U>
    where
        U: Data,
        F: Fn(Vec<T>) -> Vec<U> + Send + Sync + 'static,
    {
        self.narrow("map_partitions", move |_, data| Ok(f(data)))
    }

    pub fn map_pair<K, V, F>(&self, f: F) -> PairPartitionableDataset<K, V>
    where
        K: Data + Hash + Eq,
        V: Data,
        F: Fn(T) -> (K, V) + Send + Sync + 'static,
    {
        PairPartitionableDataset::new(self.narrow(
            "map_pair",
            move |_, data| Ok(data.into_iter().map(&f).collect()),
        ))
    }

    pub fn key_by<K, F>(&self, f: F) -> PairPartitionableDataset<K, T>
    where
        K: Data + Hash + Eq,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        PairPartitionableDataset::new(self.narrow(
            "key_by",
            move |_, data| Ok(data.into_iter().map(|x| (f(&x), x)).collect()),
        ))
    }

    /// Remove duplicate elements. The first occurrence, in partition order,
    /// survives.
    pub fn distinct(&self) -> EngineResult<Self>
    where
        T: Hash + Eq,
    {
        let keyed: PartitionableDataset<(T, ())> = self.narrow("distinct", |_, data| {
            Ok(data.into_iter().map(|x| (x, ())).collect())
        });
        let partitioner = HashPartitioner::new(self.ctx.config().shuffle_partitions)?;
        let shuffled = ShuffledStage::<T, (), ()>::new(
            self.meta("distinct"),
            Arc::clone(keyed.stage()),
            Arc::new(FirstAggregator),
            Arc::new(partitioner),
        );
        Ok(self
            .derive::<(T, ())>(Arc::new(shuffled))
            .narrow("keys", |_, data| Ok(data.into_iter().map(|(x, _)| x).collect())))
    }

    /// Concatenation of `self` and `other`; duplicates are kept.
    pub fn union(&self, other: &Self) -> Self {
        let stage = UnionStage::new(
            self.meta("union"),
            Arc::clone(&self.stage),
            Arc::clone(&other.stage),
        );
        self.derive::<T>(Arc::new(stage))
    }

    /// Regroup the elements, in order, into partitions of at most `size`
    /// elements. `size` must be positive.
    pub fn with_partition_size(&self, size: usize) -> EngineResult<Self> {
        let stage = RechunkStage::new(self.meta("with_partition_size"), Arc::clone(&self.stage), size)?;
        Ok(self.derive::<T>(Arc::new(stage)))
    }

    /// Run the tasks of stages created from the returned dataset, and of its
    /// terminal actions, on the calling thread's rayon context instead of the
    /// worker pool. Results are identical either way.
    pub fn enable_local_computation(&self, local: bool) -> Self {
        Self {
            ctx: self.ctx.clone(),
            stage: Arc::clone(&self.stage),
            local,
        }
    }

    /// Retain the materialization of this dataset according to `cache_type`.
    pub fn cache(&self, cache_type: CacheType) -> Self {
        if !cache_type.is_cached() {
            return self.clone();
        }
        let stage = CachedStage::new(self.meta("cache"), Arc::clone(&self.stage), cache_type);
        self.derive::<T>(Arc::new(stage))
    }

    /// Invoke `procedure` for every element when the dataset is evaluated.
    ///
    /// Elements of one partition are visited in order; partitions run in
    /// parallel. The first failing call aborts the stage with an
    /// `ExecutionFailure` naming the element.
    pub fn save_on_storage_manager<F>(&self, procedure: F) -> Self
    where
        F: Fn(&TaskDataContext, &StorageManager, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.narrow(
            "save_on_storage_manager",
            move |task: &NarrowTask<'_>, data: Vec<T>| {
                let context = TaskDataContext::new(task.scope.stage_id, task.partition);
                let storage = task.job.context().storage_manager();
                for element in &data {
                    procedure(&context, storage, element).map_err(|e| {
                        task.scope
                            .failure(task.partition, Some(format!("{:?}", element)), e)
                    })?;
                }
                Ok(data)
            },
        )
    }

    /// Stages this dataset depends on, starting with its own, each listed once.
    pub fn lineage(&self) -> Vec<StageInfo> {
        let mut seen = HashSet::new();
        let mut stages = Vec::new();
        self.stage.walk(&mut |info| {
            if seen.insert(info.id) {
                stages.push(info);
                true
            } else {
                false
            }
        });
        stages
    }

    // Actions

    fn action_scope(&self) -> TaskScope {
        TaskScope {
            placement: Placement::from_local_flag(self.local),
            ..self.stage.scope()
        }
    }

    fn run_job<R, F>(&self, action: &'static str, finish: F) -> EngineResult<Vec<R>>
    where
        R: Send,
        F: Fn(usize, Vec<T>) -> EngineResult<R> + Send + Sync,
    {
        let started = Instant::now();
        let job = JobRun::new(&self.ctx, self.stage.as_ref())?;
        prepare_stage(self.stage.as_ref(), &job)?;
        let outputs = run_stage_with(self.stage.as_ref(), &job, &self.action_scope(), finish)?;
        info!(
            stage_id = self.stage.id(),
            operator = self.stage.operator(),
            partitions = outputs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished {}",
            action
        );
        Ok(outputs)
    }

    pub fn collect(&self) -> EngineResult<Vec<T>> {
        Ok(self.collect_partitions()?.into_iter().flatten().collect())
    }

    /// Elements grouped by partition, in partition order.
    pub fn collect_partitions(&self) -> EngineResult<Vec<Vec<T>>> {
        self.run_job("collect", |_, data| Ok(data))
    }

    pub fn count(&self) -> EngineResult<usize> {
        Ok(self.run_job("count", |_, data| Ok(data.len()))?.into_iter().sum())
    }

    /// Evaluate the dataset and discard the elements.
    pub fn materialize(&self) -> EngineResult<()> {
        self.run_job("materialize", |_, _| Ok(())).map(|_| ())
    }

    /// Combine all elements with `f`; `None` for an empty dataset.
    ///
    /// `f` must be associative and commutative.
    pub fn reduce<F>(&self, f: F) -> EngineResult<Option<T>>
    where
        F: Fn(T, T) -> T + Send + Sync,
    {
        let partials = self.run_job("reduce", |_, data| Ok(data.into_iter().reduce(&f)))?;
        guard(|| partials.into_iter().flatten().reduce(&f))
            .map_err(|panic| self.action_scope().failure(0, None, panic))
    }

    /// The first `n` elements, computing partitions one at a time until
    /// enough are found.
    pub fn take(&self, n: usize) -> EngineResult<Vec<T>> {
        let mut taken = Vec::with_capacity(n);
        if n == 0 {
            return Ok(taken);
        }
        let job = JobRun::new(&self.ctx, self.stage.as_ref())?;
        prepare_stage(self.stage.as_ref(), &job)?;
        let scope = self.action_scope();
        let count = partition_count(self.stage.as_ref(), &job)?;
        for index in 0..count {
            let data = compute_partition(self.stage.as_ref(), &job, index)
                .map_err(|e| scope.wrap(index, e))?;
            taken.extend(data.into_iter().take(n - taken.len()));
            if taken.len() == n {
                break;
            }
        }
        Ok(taken)
    }

    pub fn first(&self) -> EngineResult<Option<T>> {
        Ok(self.take(1)?.pop())
    }

    pub fn contains(&self, element: &T) -> EngineResult<bool>
    where
        T: PartialEq,
    {
        let found = self.run_job("contains", |_, data| Ok(data.contains(element)))?;
        Ok(found.into_iter().any(|hit| hit))
    }

    fn submit<R, F>(&self, action: F) -> ValuePromise<R>
    where
        R: Send + Sync + 'static,
        F: FnOnce(&Self) -> EngineResult<R> + Send + 'static,
    {
        let (promise, resolver) = ValuePromise::channel();
        let dataset = self.clone();
        self.ctx.scheduler().spawn(move || {
            if let Err(e) = resolver.complete(action(&dataset)) {
                debug!("Background action result dropped: {}", e);
            }
        });
        promise
    }

    /// Start `collect` in the background.
    pub fn collect_async(&self) -> ValuePromise<Vec<T>> {
        self.submit(|dataset| dataset.collect())
    }

    /// Start `count` in the background.
    pub fn count_async(&self) -> ValuePromise<usize> {
        self.submit(|dataset| dataset.count())
    }
}
