//! Narrow stages: every output partition depends on one input partition.
//!
//! A narrow stage computes its partition by pulling the matching partition
//! of its parent inside the same task, so chains of narrow operators run
//! as one task per partition.

use super::stage::{Stage, StageBase, StageInfo, StageMeta, stage_meta_accessors};
use crate::scheduler::{JobRun, TaskScope};
use crate::scheduler::job::{compute_partition, partition_count, prepare_stage};
use crate::scheduler::pool::guard;
use crate::traits::{Data, EngineError, EngineResult, StageId};
use std::sync::Arc;

/// What a narrow function knows about the task running it.
pub(crate) struct NarrowTask<'a> {
    pub job: &'a JobRun,
    pub scope: TaskScope,
    pub partition: usize,
}

pub(crate) type NarrowFn<U, T> =
    Arc<dyn Fn(&NarrowTask<'_>, Vec<U>) -> EngineResult<Vec<T>> + Send + Sync>;

pub(crate) struct NarrowStage<U, T> {
    meta: StageMeta,
    parent: Arc<dyn Stage<U>>,
    f: NarrowFn<U, T>,
}

impl<U: Data, T: Data> NarrowStage<U, T> {
    pub(crate) fn new(meta: StageMeta, parent: Arc<dyn Stage<U>>, f: NarrowFn<U, T>) -> Self {
        Self { meta, parent, f }
    }
}

impl<U: Data, T: Data> StageBase for NarrowStage<U, T> {
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

impl<U: Data, T: Data> Stage<T> for NarrowStage<U, T> {
    fn prepare(&self, job: &JobRun) -> EngineResult<()> {
        prepare_stage(self.parent.as_ref(), job)
    }

    fn num_partitions(&self, job: &JobRun) -> EngineResult<usize> {
        partition_count(self.parent.as_ref(), job)
    }

    fn compute(&self, job: &JobRun, partition: usize) -> EngineResult<Vec<T>> {
        let input = compute_partition(self.parent.as_ref(), job, partition)?;
        let scope = self.scope();
        let task = NarrowTask {
            job,
            scope,
            partition,
        };
        match guard(|| (self.f)(&task, input)) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(scope.wrap(partition, e)),
            Err(panic) => Err(scope.failure(partition, None, panic)),
        }
    }
}

/// Concatenation of two stages: the partitions of `left` followed by the
/// partitions of `right`.
pub(crate) struct UnionStage<T> {
    meta: StageMeta,
    left: Arc<dyn Stage<T>>,
    right: Arc<dyn Stage<T>>,
}

impl<T: Data> UnionStage<T> {
    pub(crate) fn new(meta: StageMeta, left: Arc<dyn Stage<T>>, right: Arc<dyn Stage<T>>) -> Self {
        Self { meta, left, right }
    }
}

impl<T: Data> StageBase for UnionStage<T> {
    stage_meta_accessors!();

    fn parent_ids(&self) -> Vec<StageId> {
        vec![self.left.id(), self.right.id()]
    }

    fn walk(&self, visit: &mut dyn FnMut(StageInfo) -> bool) {
        if visit(self.info()) {
            self.left.walk(visit);
            self.right.walk(visit);
        }
    }
}

impl<T: Data> Stage<T> for UnionStage<T> {
    fn prepare(&self, job: &JobRun) -> EngineResult<()> {
        prepare_stage(self.left.as_ref(), job)?;
        prepare_stage(self.right.as_ref(), job)
    }

    fn num_partitions(&self, job: &JobRun) -> EngineResult<usize> {
        Ok(partition_count(self.left.as_ref(), job)? + partition_count(self.right.as_ref(), job)?)
    }

    fn compute(&self, job: &JobRun, partition: usize) -> EngineResult<Vec<T>> {
        let left = partition_count(self.left.as_ref(), job)?;
        if partition < left {
            return compute_partition(self.left.as_ref(), job, partition);
        }
        let right = partition - left;
        if right < partition_count(self.right.as_ref(), job)? {
            compute_partition(self.right.as_ref(), job, right)
        } else {
            Err(EngineError::illegal_state(format!(
                "union stage {} has no partition {}",
                self.id(),
                partition
            )))
        }
    }
}
