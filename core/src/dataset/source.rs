//! Leaf stages reading a data source provider.

use super::stage::{Stage, StageBase, StageInfo, StageMeta, stage_meta_accessors};
use crate::provider::DataSourceIteratorProvider;
use crate::scheduler::JobRun;
use crate::scheduler::pool::guard;
use crate::traits::{Data, EngineError, EngineResult, Partition, StageId};
use std::sync::Arc;
use tracing::debug;

/// How provider items are split into partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chunking {
    /// At most this many elements per partition.
    Size(usize),
    /// Exactly this many partitions of near-equal size.
    Count(usize),
}

impl Chunking {
    pub(crate) fn validate(self) -> EngineResult<Self> {
        match self {
            Chunking::Size(0) => Err(EngineError::invalid_argument(
                "partition size must be positive",
            )),
            Chunking::Count(0) => Err(EngineError::invalid_argument(
                "number of partitions must be positive",
            )),
            other => Ok(other),
        }
    }
}

/// Splits `items` into at most `size` elements per partition, keeping order.
pub(crate) fn chunk_by_size<T>(items: Vec<T>, size: usize) -> Vec<Partition<T>> {
    let mut partitions = Vec::with_capacity(items.len().div_ceil(size.max(1)));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            partitions.push(Partition::new(partitions.len(), std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        partitions.push(Partition::new(partitions.len(), current));
    }
    partitions
}

fn chunk_by_count<T>(items: Vec<T>, count: usize) -> Vec<Partition<T>> {
    let base = items.len() / count;
    let extra = items.len() % count;
    let mut items = items.into_iter();
    (0..count)
        .map(|index| {
            let len = base + usize::from(index < extra);
            Partition::new(index, items.by_ref().take(len).collect())
        })
        .collect()
}

pub(crate) struct SourceStage<T> {
    meta: StageMeta,
    provider: Arc<dyn DataSourceIteratorProvider<T>>,
    chunking: Chunking,
}

impl<T: Data> SourceStage<T> {
    /// `chunking` must have been validated.
    pub(crate) fn new(
        meta: StageMeta,
        provider: Arc<dyn DataSourceIteratorProvider<T>>,
        chunking: Chunking,
    ) -> Self {
        Self {
            meta,
            provider,
            chunking,
        }
    }

    fn read(&self) -> EngineResult<Vec<Partition<T>>> {
        let scope = self.scope();
        let mut items = Vec::new();
        for item in self.provider.iter()? {
            let partition = match self.chunking {
                Chunking::Size(size) => items.len() / size,
                Chunking::Count(_) => 0,
            };
            items.push(item.map_err(|e| scope.failure(partition, None, e))?);
        }
        Ok(match self.chunking {
            Chunking::Size(size) => chunk_by_size(items, size),
            Chunking::Count(count) => chunk_by_count(items, count),
        })
    }
}

impl<T: Data> StageBase for SourceStage<T> {
    stage_meta_accessors!();

    fn parent_ids(&self) -> Vec<StageId> {
        Vec::new()
    }

    fn walk(&self, visit: &mut dyn FnMut(StageInfo) -> bool) {
        visit(self.info());
    }
}

impl<T: Data> Stage<T> for SourceStage<T> {
    fn prepare(&self, job: &JobRun) -> EngineResult<()> {
        if job.is_memoized(self.id()) {
            return Ok(());
        }
        let scope = self.scope();
        let partitions = guard(|| self.read())
            .map_err(|panic| scope.failure(0, None, panic))?
            .map_err(|e| scope.wrap(0, e))?;
        debug!(
            "Source stage {} produced {} partitions",
            self.id(),
            partitions.len()
        );
        job.memoize(self.id(), Arc::new(partitions));
        Ok(())
    }

    fn num_partitions(&self, _job: &JobRun) -> EngineResult<usize> {
        Err(EngineError::illegal_state(format!(
            "source stage {} was not prepared",
            self.id()
        )))
    }

    fn compute(&self, _job: &JobRun, _partition: usize) -> EngineResult<Vec<T>> {
        Err(EngineError::illegal_state(format!(
            "source stage {} was not prepared",
            self.id()
        )))
    }
}
