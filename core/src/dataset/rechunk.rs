//! Re-chunking barrier applied by `with_partition_size`.

use super::source::chunk_by_size;
use super::stage::{Stage, StageBase, StageInfo, StageMeta, stage_meta_accessors};
use crate::scheduler::JobRun;
use crate::scheduler::job::materialize;
use crate::traits::{Data, EngineError, EngineResult, StageId};
use std::sync::Arc;
use tracing::debug;

/// Regroups the elements of its parent, in order, into partitions of at
/// most `size` elements.
pub(crate) struct RechunkStage<T> {
    meta: StageMeta,
    parent: Arc<dyn Stage<T>>,
    size: usize,
}

impl<T: Data> RechunkStage<T> {
    pub(crate) fn new(meta: StageMeta, parent: Arc<dyn Stage<T>>, size: usize) -> EngineResult<Self> {
        if size == 0 {
            return Err(EngineError::invalid_argument(
                "partition size must be positive",
            ));
        }
        Ok(Self { meta, parent, size })
    }
}

impl<T: Data> StageBase for RechunkStage<T> {
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

impl<T: Data> Stage<T> for RechunkStage<T> {
    fn prepare(&self, job: &JobRun) -> EngineResult<()> {
        if job.is_memoized(self.id()) {
            return Ok(());
        }
        let input = materialize(self.parent.as_ref(), job)?;
        let elements: Vec<T> = input.iter().flat_map(|p| p.data().iter().cloned()).collect();
        let partitions = chunk_by_size(elements, self.size);
        debug!(
            "Stage {} regrouped {} partitions into {} of at most {} elements",
            self.id(),
            input.len(),
            partitions.len(),
            self.size
        );
        job.memoize(self.id(), Arc::new(partitions));
        Ok(())
    }

    fn num_partitions(&self, _job: &JobRun) -> EngineResult<usize> {
        Err(EngineError::illegal_state(format!(
            "stage {} was not prepared",
            self.id()
        )))
    }

    fn compute(&self, _job: &JobRun, _partition: usize) -> EngineResult<Vec<T>> {
        Err(EngineError::illegal_state(format!(
            "stage {} was not prepared",
            self.id()
        )))
    }
}
