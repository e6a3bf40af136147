//! Keyed datasets and the operators that shuffle by key.

use super::PartitionableDataset;
use super::shuffled::{ShuffledStage, SortedStage};
use super::stage::StageInfo;
use crate::cache::CacheType;
use crate::context::FlowContext;
use crate::promise::ValuePromise;
use crate::shuffle::{
    Aggregator, CoGroupAggregator, CountAggregator, GroupAggregator, HashPartitioner,
    ReduceAggregator, Side,
};
use crate::storage::StorageManager;
use crate::task::TaskDataContext;
use crate::traits::{Data, EngineResult, StageId};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// A dataset of `(K, V)` pairs.
///
/// Keyed shuffles use a hash partitioner with the context's
/// `shuffle_partitions`; within one output partition, keys appear in the
/// order they were first seen.
pub struct PairPartitionableDataset<K: Data, V: Data> {
    inner: PartitionableDataset<(K, V)>,
}

impl<K: Data, V: Data> Clone for PairPartitionableDataset<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Data, V: Data> std::fmt::Debug for PairPartitionableDataset<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PairPartitionableDataset")
            .field(&self.inner)
            .finish()
    }
}

impl<K, V> PairPartitionableDataset<K, V>
where
    K: Data + Hash + Eq,
    V: Data,
{
    pub(crate) fn new(inner: PartitionableDataset<(K, V)>) -> Self {
        Self { inner }
    }

    pub fn context(&self) -> &FlowContext {
        self.inner.context()
    }

    pub fn id(&self) -> StageId {
        self.inner.id()
    }

    pub fn as_dataset(&self) -> &PartitionableDataset<(K, V)> {
        &self.inner
    }

    pub fn into_dataset(self) -> PartitionableDataset<(K, V)> {
        self.inner
    }

    fn shuffle<C: Data>(
        &self,
        operator: &'static str,
        aggregator: Arc<dyn Aggregator<V, C>>,
    ) -> EngineResult<PairPartitionableDataset<K, C>> {
        let partitioner = HashPartitioner::new(self.context().config().shuffle_partitions)?;
        let stage = ShuffledStage::<K, V, C>::new(
            self.inner.meta(operator),
            Arc::clone(self.inner.stage()),
            aggregator,
            Arc::new(partitioner),
        );
        Ok(PairPartitionableDataset::new(
            self.inner.derive::<(K, C)>(Arc::new(stage)),
        ))
    }

    // Keyed shuffles

    /// Merge the values of every key with `f`, which must be associative
    /// and commutative.
    pub fn reduce_by_key<F>(&self, f: F) -> EngineResult<Self>
    where
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        self.shuffle("reduce_by_key", Arc::new(ReduceAggregator::new(f)))
    }

    /// One pair per key holding all of its values, in partition order.
    pub fn group_by_key(&self) -> EngineResult<PairPartitionableDataset<K, Vec<V>>> {
        self.shuffle("group_by_key", Arc::new(GroupAggregator))
    }

    /// Globally sort the pairs by key. Pairs with equal keys keep their
    /// relative order.
    pub fn sort_by_key(&self, ascending: bool) -> Self
    where
        K: Ord,
    {
        let config = self.context().config();
        let stage = SortedStage::new(
            self.inner.meta("sort_by_key"),
            Arc::clone(self.inner.stage()),
            ascending,
            config.shuffle_partitions,
            config.sort_sample_size,
        );
        Self::new(self.inner.derive::<(K, V)>(Arc::new(stage)))
    }

    /// Inner join: every combination of a left and a right value sharing a
    /// key. Keys present on one side only are dropped.
    pub fn join<W: Data>(
        &self,
        other: &PairPartitionableDataset<K, W>,
    ) -> EngineResult<PairPartitionableDataset<K, (V, W)>> {
        let left = self.inner.narrow("join", |_, data| {
            Ok(data
                .into_iter()
                .map(|(k, v)| (k, Side::<V, W>::Left(v)))
                .collect())
        });
        let right = other.inner.narrow("join", |_, data| {
            Ok(data
                .into_iter()
                .map(|(k, w)| (k, Side::<V, W>::Right(w)))
                .collect())
        });
        let tagged = PairPartitionableDataset::new(left.union(&right));
        let grouped = tagged.shuffle::<(Vec<V>, Vec<W>)>("join", Arc::new(CoGroupAggregator))?;

        Ok(PairPartitionableDataset::new(grouped.inner.narrow(
            "join",
            |_, data| {
                let mut joined = Vec::new();
                for (key, (lefts, rights)) in data {
                    for v in &lefts {
                        for w in &rights {
                            joined.push((key.clone(), (v.clone(), w.clone())));
                        }
                    }
                }
                Ok(joined)
            },
        )))
    }

    /// Remove duplicate pairs, keeping the first occurrence.
    pub fn distinct(&self) -> EngineResult<Self>
    where
        V: Hash + Eq,
    {
        Ok(Self::new(self.inner.distinct()?))
    }

    // Narrow operators

    pub fn keys(&self) -> PartitionableDataset<K> {
        self.inner
            .narrow("keys", |_, data| Ok(data.into_iter().map(|(k, _)| k).collect()))
    }

    pub fn values(&self) -> PartitionableDataset<V> {
        self.inner
            .narrow("values", |_, data| Ok(data.into_iter().map(|(_, v)| v).collect()))
    }

    /// Apply `f` to every value; keys and partitioning are kept.
    pub fn map_values<U, F>(&self, f: F) -> PairPartitionableDataset<K, U>
    where
        U: Data,
        F: Fn(V) -> U + Send + Sync + 'static,
    {
        PairPartitionableDataset::new(self.inner.narrow("map_values", move |_, data| {
            Ok(data.into_iter().map(|(k, v)| (k, f(v))).collect())
        }))
    }

    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&(K, V)) -> bool + Send + Sync + 'static,
    {
        Self::new(self.inner.filter(predicate))
    }

    /// Concatenate with any dataset of pairs; use `as_dataset` to pass a
    /// keyed one.
    pub fn union(&self, other: &PartitionableDataset<(K, V)>) -> Self {
        Self::new(self.inner.union(other))
    }

    pub fn with_partition_size(&self, size: usize) -> EngineResult<Self> {
        Ok(Self::new(self.inner.with_partition_size(size)?))
    }

    pub fn enable_local_computation(&self, local: bool) -> Self {
        Self::new(self.inner.enable_local_computation(local))
    }

    pub fn cache(&self, cache_type: CacheType) -> Self {
        Self::new(self.inner.cache(cache_type))
    }

    pub fn save_on_storage_manager<F>(&self, procedure: F) -> Self
    where
        F: Fn(&TaskDataContext, &StorageManager, &(K, V)) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self::new(self.inner.save_on_storage_manager(procedure))
    }

    pub fn lineage(&self) -> Vec<StageInfo> {
        self.inner.lineage()
    }

    // Actions

    pub fn collect(&self) -> EngineResult<Vec<(K, V)>> {
        self.inner.collect()
    }

    pub fn count(&self) -> EngineResult<usize> {
        self.inner.count()
    }

    pub fn materialize(&self) -> EngineResult<()> {
        self.inner.materialize()
    }

    pub fn take(&self, n: usize) -> EngineResult<Vec<(K, V)>> {
        self.inner.take(n)
    }

    pub fn first(&self) -> EngineResult<Option<(K, V)>> {
        self.inner.first()
    }

    /// Number of pairs per key.
    pub fn count_by_key(&self) -> EngineResult<HashMap<K, u64>> {
        let counted = self.shuffle::<u64>("count_by_key", Arc::new(CountAggregator))?;
        Ok(counted.collect()?.into_iter().collect())
    }

    /// Collect into a map. When a key occurs several times the last pair,
    /// in partition order, wins.
    pub fn collect_as_map(&self) -> EngineResult<HashMap<K, V>> {
        Ok(self.collect()?.into_iter().collect())
    }

    pub fn collect_async(&self) -> ValuePromise<Vec<(K, V)>> {
        self.inner.collect_async()
    }

    pub fn count_async(&self) -> ValuePromise<usize> {
        self.inner.count_async()
    }
}
