//! Keyed shuffle stages.
//!
//! A shuffle runs as a barrier inside `prepare`: every map task combines
//! its partition locally and splits the result into one bucket per reduce
//! partition; once all map outputs exist the buckets are regrouped by
//! reduce partition and every reduce task merges its buckets in map order.

use super::stage::{Stage, StageBase, StageInfo, StageMeta, stage_meta_accessors};
use crate::scheduler::JobRun;
use crate::scheduler::job::{prepare_stage, run_stage_with};
use crate::shuffle::combine::CombineBuffer;
use crate::shuffle::{Aggregator, Partitioner, RangePartitioner, sample_keys};
use crate::traits::{Data, EngineError, EngineResult, Partition, StageId};
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Regroup `[map][reduce]` buckets into `[reduce][map]`.
fn transpose<X>(map_outputs: Vec<Vec<Vec<X>>>, num_reduce: usize) -> Vec<Vec<Vec<X>>> {
    let mut reduce_inputs: Vec<Vec<Vec<X>>> = (0..num_reduce)
        .map(|_| Vec::with_capacity(map_outputs.len()))
        .collect();
    for buckets in map_outputs {
        for (reduce, bucket) in buckets.into_iter().enumerate() {
            reduce_inputs[reduce].push(bucket);
        }
    }
    reduce_inputs
}

fn not_prepared(id: StageId) -> EngineError {
    EngineError::illegal_state(format!("shuffle stage {} was not prepared", id))
}

/// Combines the values of every key into one `(K, C)` pair.
///
/// Output pairs of one reduce partition appear in the order their keys were
/// first seen, scanning map partitions in index order.
pub(crate) struct ShuffledStage<K, V, C> {
    meta: StageMeta,
    parent: Arc<dyn Stage<(K, V)>>,
    aggregator: Arc<dyn Aggregator<V, C>>,
    partitioner: Arc<dyn Partitioner<K>>,
}

impl<K, V, C> ShuffledStage<K, V, C>
where
    K: Data + Hash + Eq,
    V: Data,
    C: Data,
{
    pub(crate) fn new(
        meta: StageMeta,
        parent: Arc<dyn Stage<(K, V)>>,
        aggregator: Arc<dyn Aggregator<V, C>>,
        partitioner: Arc<dyn Partitioner<K>>,
    ) -> Self {
        Self {
            meta,
            parent,
            aggregator,
            partitioner,
        }
    }
}

impl<K, V, C> StageBase for ShuffledStage<K, V, C>
where
    K: Data + Hash + Eq,
    V: Data,
    C: Data,
{
    stage_meta_accessors!();

    fn parent_ids(&self) -> Vec<StageId> {
        vec![self.parent.id()]
    }

    fn walk(&self, visit: &mut dyn FnMut(StageInfo) -> bool) {
        if visit(self.info()) {
            self.parent.walk(visit);
        }
    }
}

impl<K, V, C> Stage<(K, C)> for ShuffledStage<K, V, C>
where
    K: Data + Hash + Eq,
    V: Data,
    C: Data,
{
    fn prepare(&self, job: &JobRun) -> EngineResult<()> {
        if job.is_memoized(self.id()) {
            return Ok(());
        }
        prepare_stage(self.parent.as_ref(), job)?;

        let scope = self.scope();
        let aggregator = self.aggregator.as_ref();
        let num_reduce = self.partitioner.num_partitions();

        let map_outputs = run_stage_with(self.parent.as_ref(), job, &scope, |partition, data| {
            let mut combined = CombineBuffer::new();
            for (key, value) in data {
                combined.insert_value(aggregator, &scope, partition, key, value)?;
            }
            let mut buckets: Vec<Vec<(K, C)>> = (0..num_reduce).map(|_| Vec::new()).collect();
            for (key, combiner) in combined.into_entries() {
                buckets[self.partitioner.partition(&key)].push((key, combiner));
            }
            Ok(buckets)
        })?;
        debug!(
            "Shuffle {} ({}): {} map outputs into {} reduce partitions",
            self.id(),
            self.operator(),
            map_outputs.len(),
            num_reduce
        );

        let reduce_inputs = transpose(map_outputs, num_reduce);
        let outputs = job.context().scheduler().run_tasks(
            &scope,
            reduce_inputs,
            |partition, buckets: Vec<Vec<(K, C)>>| {
                let mut merged = CombineBuffer::new();
                for (key, combiner) in buckets.into_iter().flatten() {
                    merged.merge_combiner(aggregator, &scope, partition, key, combiner)?;
                }
                Ok(Partition::new(partition, merged.into_entries()))
            },
        )?;
        job.memoize(self.id(), Arc::new(outputs));
        Ok(())
    }

    fn num_partitions(&self, _job: &JobRun) -> EngineResult<usize> {
        Err(not_prepared(self.id()))
    }

    fn compute(&self, _job: &JobRun, _partition: usize) -> EngineResult<Vec<(K, C)>> {
        Err(not_prepared(self.id()))
    }
}

/// Globally sorts pairs by key.
///
/// Keys are sampled to build a range partitioner; every range is then
/// sorted with a stable sort, so pairs with equal keys keep their input
/// order.
pub(crate) struct SortedStage<K, V> {
    meta: StageMeta,
    parent: Arc<dyn Stage<(K, V)>>,
    ascending: bool,
    num_partitions: usize,
    sample_size: usize,
}

impl<K: Data + Ord, V: Data> SortedStage<K, V> {
    pub(crate) fn new(
        meta: StageMeta,
        parent: Arc<dyn Stage<(K, V)>>,
        ascending: bool,
        num_partitions: usize,
        sample_size: usize,
    ) -> Self {
        Self {
            meta,
            parent,
            ascending,
            num_partitions,
            sample_size,
        }
    }
}

impl<K: Data + Ord, V: Data> StageBase for SortedStage<K, V> {
    stage_meta_accessors!();

    fn parent_ids(&self) -> Vec<StageId> {
        vec![self.parent.id()]
    }

    fn walk(&self, visit: &mut dyn FnMut(StageInfo) -> bool) {
        if visit(self.info()) {
            self.parent.walk(visit);
        }
    }
}

impl<K: Data + Ord, V: Data> Stage<(K, V)> for SortedStage<K, V> {
    fn prepare(&self, job: &JobRun) -> EngineResult<()> {
        if job.is_memoized(self.id()) {
            return Ok(());
        }
        prepare_stage(self.parent.as_ref(), job)?;

        let scope = self.scope();
        let inputs = run_stage_with(self.parent.as_ref(), job, &scope, |_, data| Ok(data))?;
        let per_partition = self.sample_size.div_ceil(inputs.len().max(1));
        let partitioner = RangePartitioner::from_sample(
            self.num_partitions,
            sample_keys(&inputs, per_partition),
            self.ascending,
        );
        let num_ranges = partitioner.num_partitions();
        debug!(
            "Sort {}: {} input partitions into {} ranges",
            self.id(),
            inputs.len(),
            num_ranges
        );

        let map_outputs = job.context().scheduler().run_tasks(&scope, inputs, |_, data| {
            let mut buckets: Vec<Vec<(K, V)>> = (0..num_ranges).map(|_| Vec::new()).collect();
            for (key, value) in data {
                buckets[partitioner.partition(&key)].push((key, value));
            }
            Ok(buckets)
        })?;

        let ascending = self.ascending;
        let outputs = job.context().scheduler().run_tasks(
            &scope,
            transpose(map_outputs, num_ranges),
            |partition, buckets: Vec<Vec<(K, V)>>| {
                let mut data: Vec<(K, V)> = buckets.into_iter().flatten().collect();
                if ascending {
                    data.sort_by(|a, b| a.0.cmp(&b.0));
                } else {
                    data.sort_by(|a, b| b.0.cmp(&a.0));
                }
                Ok(Partition::new(partition, data))
            },
        )?;
        job.memoize(self.id(), Arc::new(outputs));
        Ok(())
    }

    fn num_partitions(&self, _job: &JobRun) -> EngineResult<usize> {
        Err(not_prepared(self.id()))
    }

    fn compute(&self, _job: &JobRun, _partition: usize) -> EngineResult<Vec<(K, V)>> {
        Err(not_prepared(self.id()))
    }
}
