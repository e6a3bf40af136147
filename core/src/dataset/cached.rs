//! Stages retained by the cache manager.

use super::stage::{Stage, StageBase, StageInfo, StageMeta, stage_meta_accessors};
use crate::cache::CacheType;
use crate::scheduler::JobRun;
use crate::scheduler::job::materialize;
use crate::traits::{Data, EngineError, EngineResult, StageId};
use std::sync::Arc;
use tracing::info;

/// Serves its parent's partitions from the cache, computing and storing
/// them on the first evaluation. A hit never touches the parent, and jobs
/// racing on a miss wait for one computation.
pub(crate) struct CachedStage<T> {
    meta: StageMeta,
    parent: Arc<dyn Stage<T>>,
    cache_type: CacheType,
}

impl<T: Data> CachedStage<T> {
    pub(crate) fn new(meta: StageMeta, parent: Arc<dyn Stage<T>>, cache_type: CacheType) -> Self {
        Self {
            meta,
            parent,
            cache_type,
        }
    }
}

impl<T: Data> StageBase for CachedStage<T> {
    stage_meta_accessors!();

    fn parent_ids(&self) -> Vec<StageId> {
        vec![self.parent.id()]
    }

    fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    fn walk(&self, visit: &mut dyn FnMut(StageInfo) -> bool) {
        if visit(self.info()) {
            self.parent.walk(visit);
        }
    }
}

impl<T: Data> Stage<T> for CachedStage<T> {
    fn prepare(&self, job: &JobRun) -> EngineResult<()> {
        if job.is_memoized(self.id()) {
            return Ok(());
        }
        let partitions = job
            .context()
            .cache_manager()
            .get_or_fill(self.id(), self.cache_type, || {
                let partitions = materialize(self.parent.as_ref(), job)?;
                info!(
                    "Cached {} partitions of stage {} ({:?})",
                    partitions.len(),
                    self.id(),
                    self.cache_type
                );
                Ok(partitions)
            })?;
        job.memoize(self.id(), partitions);
        Ok(())
    }

    fn num_partitions(&self, _job: &JobRun) -> EngineResult<usize> {
        Err(EngineError::illegal_state(format!(
            "cached stage {} was not prepared",
            self.id()
        )))
    }

    fn compute(&self, _job: &JobRun, _partition: usize) -> EngineResult<Vec<T>> {
        Err(EngineError::illegal_state(format!(
            "cached stage {} was not prepared",
            self.id()
        )))
    }
}
