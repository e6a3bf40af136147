//! Per-task token handed to storage callbacks.

use crate::traits::StageId;
use uuid::Uuid;

/// Identity of the task invoking a `save_on_storage_manager` procedure.
///
/// The engine creates one per partition task and never interprets it
/// further; procedures may use it to name per-task structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDataContext {
    task_id: Uuid,
    stage_id: StageId,
    partition_index: usize,
}

impl TaskDataContext {
    pub(crate) fn new(stage_id: StageId, partition_index: usize) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            stage_id,
            partition_index,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    pub fn partition_index(&self) -> usize {
        self.partition_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_task_gets_its_own_id() {
        let a = TaskDataContext::new(4, 0);
        let b = TaskDataContext::new(4, 0);
        assert_ne!(a.task_id(), b.task_id());
        assert_eq!(a.stage_id(), 4);
        assert_eq!(b.partition_index(), 0);
    }
}
