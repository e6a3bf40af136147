//! Evaluation of one terminal action.
//!
//! A `JobRun` lives for a single action. Barrier stages (sources, shuffles,
//! re-chunking, caches) and stages reached through several paths of the
//! graph are materialized once into the job's memo; narrow stages are
//! computed on demand inside the task of the partition that needs them,
//! which fuses consecutive narrow operators into one task.

use crate::context::FlowContext;
use crate::dataset::stage::Stage;
use crate::scheduler::TaskScope;
use crate::traits::{Data, EngineError, EngineResult, Partition, StageId};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

type Memo = HashMap<StageId, Arc<dyn Any + Send + Sync>>;

pub struct JobRun {
    context: FlowContext,
    shared: HashSet<StageId>,
    memo: RwLock<Memo>,
}

impl std::fmt::Debug for JobRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRun")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl JobRun {
    pub(crate) fn new<T: Data>(context: &FlowContext, root: &dyn Stage<T>) -> EngineResult<Self> {
        context.ensure_active()?;

        let mut visits: HashMap<StageId, usize> = HashMap::new();
        root.walk(&mut |info| {
            let count = visits.entry(info.id).or_insert(0);
            *count += 1;
            *count == 1
        });
        let shared: HashSet<StageId> = visits
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id)
            .collect();
        if !shared.is_empty() {
            debug!(?shared, "Stages reached through several paths");
        }

        Ok(Self {
            context: context.clone(),
            shared,
            memo: RwLock::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &FlowContext {
        &self.context
    }

    fn is_shared(&self, id: StageId) -> bool {
        self.shared.contains(&id)
    }

    pub(crate) fn is_memoized(&self, id: StageId) -> bool {
        self.memo
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub(crate) fn memoized<T: Data>(&self, id: StageId) -> EngineResult<Option<Arc<Vec<Partition<T>>>>> {
        let entry = self
            .memo
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        match entry {
            None => Ok(None),
            Some(any) => any.downcast::<Vec<Partition<T>>>().map(Some).map_err(|_| {
                EngineError::illegal_state(format!(
                    "stage {} was materialized with another element type",
                    id
                ))
            }),
        }
    }

    pub(crate) fn memoize<T: Data>(
        &self,
        id: StageId,
        partitions: Arc<Vec<Partition<T>>>,
    ) -> Arc<Vec<Partition<T>>> {
        self.memo
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&partitions) as Arc<dyn Any + Send + Sync>);
        partitions
    }
}

/// Make every partition of `stage` computable in `job`.
pub(crate) fn prepare_stage<T: Data>(stage: &dyn Stage<T>, job: &JobRun) -> EngineResult<()> {
    if job.is_memoized(stage.id()) {
        return Ok(());
    }
    stage.prepare(job)?;
    if job.is_shared(stage.id()) && !job.is_memoized(stage.id()) {
        let partitions = compute_all(stage, job)?;
        job.memoize(stage.id(), Arc::new(partitions));
    }
    Ok(())
}

pub(crate) fn partition_count<T: Data>(stage: &dyn Stage<T>, job: &JobRun) -> EngineResult<usize> {
    match job.memoized::<T>(stage.id())? {
        Some(partitions) => Ok(partitions.len()),
        None => stage.num_partitions(job),
    }
}

/// Elements of one partition of a prepared stage.
pub(crate) fn compute_partition<T: Data>(
    stage: &dyn Stage<T>,
    job: &JobRun,
    index: usize,
) -> EngineResult<Vec<T>> {
    match job.memoized::<T>(stage.id())? {
        Some(partitions) => partitions
            .get(index)
            .map(Partition::to_vec)
            .ok_or_else(|| {
                EngineError::illegal_state(format!(
                    "stage {} has no partition {}",
                    stage.id(),
                    index
                ))
            }),
        None => stage.compute(job, index),
    }
}

/// Run one task per partition of a prepared stage and apply `finish` to its
/// elements. Failures are attributed to `scope`.
pub(crate) fn run_stage_with<T, R, F>(
    stage: &dyn Stage<T>,
    job: &JobRun,
    scope: &TaskScope,
    finish: F,
) -> EngineResult<Vec<R>>
where
    T: Data,
    R: Send,
    F: Fn(usize, Vec<T>) -> EngineResult<R> + Send + Sync,
{
    let count = partition_count(stage, job)?;
    job.context().scheduler().run_tasks(
        scope,
        (0..count).collect(),
        |_, index: usize| finish(index, compute_partition(stage, job, index)?),
    )
}

fn compute_all<T: Data>(stage: &dyn Stage<T>, job: &JobRun) -> EngineResult<Vec<Partition<T>>> {
    run_stage_with(stage, job, &stage.scope(), |index, data| {
        Ok(Partition::new(index, data))
    })
}

/// Prepare `stage` and return all of its partitions.
pub(crate) fn materialize<T: Data>(
    stage: &dyn Stage<T>,
    job: &JobRun,
) -> EngineResult<Arc<Vec<Partition<T>>>> {
    prepare_stage(stage, job)?;
    if let Some(partitions) = job.memoized::<T>(stage.id())? {
        return Ok(partitions);
    }
    Ok(Arc::new(compute_all(stage, job)?))
}
