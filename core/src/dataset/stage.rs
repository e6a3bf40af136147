//! Stage descriptors.
//!
//! Every transformation creates one immutable stage that references its
//! upstream stages through `Arc`. Stages only describe work; a `JobRun`
//! evaluates them.

use crate::cache::CacheType;
use crate::scheduler::{JobRun, Placement, TaskScope};
use crate::traits::{Data, EngineResult, StageId};

/// Diagnostic description of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub id: StageId,
    pub operator: &'static str,
    pub parents: Vec<StageId>,
    pub placement: Placement,
    pub cache_type: CacheType,
}

/// Identity shared by every stage implementation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageMeta {
    pub id: StageId,
    pub operator: &'static str,
    pub placement: Placement,
}

impl StageMeta {
    pub(crate) fn new(id: StageId, operator: &'static str, placement: Placement) -> Self {
        Self {
            id,
            operator,
            placement,
        }
    }
}

/// Element-type independent part of a stage.
pub trait StageBase: Send + Sync {
    fn id(&self) -> StageId;

    fn operator(&self) -> &'static str;

    fn placement(&self) -> Placement;

    fn parent_ids(&self) -> Vec<StageId>;

    fn cache_type(&self) -> CacheType {
        CacheType::None
    }

    /// Visit this stage, then its ancestors while `visit` returns true.
    fn walk(&self, visit: &mut dyn FnMut(StageInfo) -> bool);

    fn info(&self) -> StageInfo {
        StageInfo {
            id: self.id(),
            operator: self.operator(),
            parents: self.parent_ids(),
            placement: self.placement(),
            cache_type: self.cache_type(),
        }
    }

    fn scope(&self) -> TaskScope {
        TaskScope {
            stage_id: self.id(),
            operator: self.operator(),
            placement: self.placement(),
        }
    }
}

/// A stage producing partitions of `T`.
pub trait Stage<T: Data>: StageBase {
    /// Run every barrier this stage depends on. Called once per job, on the
    /// driver, before any partition of the stage is computed.
    fn prepare(&self, job: &JobRun) -> EngineResult<()>;

    fn num_partitions(&self, job: &JobRun) -> EngineResult<usize>;

    /// Elements of one partition. Only called after `prepare`.
    fn compute(&self, job: &JobRun, partition: usize) -> EngineResult<Vec<T>>;
}

/// Implements the `StageBase` accessors from a `meta: StageMeta` field.
macro_rules! stage_meta_accessors {
    () => {
        fn id(&self) -> $crate::traits::StageId {
            self.meta.id
        }

        fn operator(&self) -> &'static str {
            self.meta.operator
        }

        fn placement(&self) -> $crate::scheduler::Placement {
            self.meta.placement
        }
    };
}
pub(crate) use stage_meta_accessors;
