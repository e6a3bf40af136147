//! Parallel task execution on rayon.

use crate::traits::{EngineError, EngineResult, StageId};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Where the tasks of a stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// In the rayon context of the calling thread.
    Local,
    /// On the scheduler's dedicated worker pool.
    #[default]
    WorkerPool,
}

impl Placement {
    pub fn from_local_flag(local: bool) -> Self {
        if local {
            Placement::Local
        } else {
            Placement::WorkerPool
        }
    }
}

/// Identity of the stage whose tasks are running, used to label failures.
#[derive(Debug, Clone, Copy)]
pub struct TaskScope {
    pub stage_id: StageId,
    pub operator: &'static str,
    pub placement: Placement,
}

impl TaskScope {
    pub fn failure(
        &self,
        partition: usize,
        key: Option<String>,
        source: impl Into<anyhow::Error>,
    ) -> EngineError {
        EngineError::ExecutionFailure {
            stage_id: self.stage_id,
            operator: self.operator,
            partition,
            key,
            source: source.into(),
        }
    }

    /// Attach stage identity to an error raised by a task. Errors that
    /// already name a stage are returned unchanged.
    pub fn wrap(&self, partition: usize, error: EngineError) -> EngineError {
        if error.is_stage_failure() {
            error
        } else {
            self.failure(partition, None, error)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    anyhow::anyhow!("task panicked: {}", message)
}

/// Run `f`, turning a panic into an error.
pub(crate) fn guard<R>(f: impl FnOnce() -> R) -> Result<R, anyhow::Error> {
    catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

/// Executes partition tasks on a rayon thread pool.
#[derive(Debug)]
pub struct Scheduler {
    pool: rayon::ThreadPool,
    num_workers: usize,
    next_job: AtomicUsize,
}

impl Scheduler {
    pub fn new(num_workers: usize) -> EngineResult<Self> {
        if num_workers == 0 {
            return Err(EngineError::invalid_argument(
                "scheduler needs at least one worker",
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("partflow-worker-{}", i))
            .build()
            .map_err(|e| EngineError::illegal_state(format!("cannot start worker pool: {}", e)))?;
        Ok(Self {
            pool,
            num_workers,
            next_job: AtomicUsize::new(0),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Run one task per input in parallel and return the outputs in input
    /// order.
    ///
    /// The first failing task aborts the stage: its error (or panic) is
    /// returned as an `ExecutionFailure` and the other outputs are dropped.
    pub fn run_tasks<I, R, F>(&self, scope: &TaskScope, inputs: Vec<I>, task: F) -> EngineResult<Vec<R>>
    where
        I: Send,
        R: Send,
        F: Fn(usize, I) -> EngineResult<R> + Send + Sync,
    {
        debug!(
            stage_id = scope.stage_id,
            operator = scope.operator,
            tasks = inputs.len(),
            placement = ?scope.placement,
            "Running stage tasks"
        );

        let run = || {
            inputs
                .into_par_iter()
                .enumerate()
                .map(|(i, input)| match guard(|| task(i, input)) {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(scope.wrap(i, e)),
                    Err(panic) => Err(scope.failure(i, None, panic)),
                })
                .collect::<EngineResult<Vec<R>>>()
        };

        match scope.placement {
            Placement::Local => run(),
            Placement::WorkerPool => self.pool.install(run),
        }
    }

    /// Run `job` on its own background thread. Its stage tasks still run on
    /// the worker pool, which never blocks on a whole job.
    ///
    /// If no thread can be started, `job` is dropped unrun.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = std::thread::Builder::new()
            .name(format!("partflow-job-{}", id))
            .spawn(job)
        {
            warn!("Cannot start background job {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ErrorKind;

    fn scope(placement: Placement) -> TaskScope {
        TaskScope {
            stage_id: 9,
            operator: "map",
            placement,
        }
    }

    #[test]
    fn test_outputs_keep_input_order() {
        let scheduler = Scheduler::new(3).unwrap();
        for placement in [Placement::Local, Placement::WorkerPool] {
            let out = scheduler
                .run_tasks(&scope(placement), vec![1, 2, 3, 4], |i, x| Ok((i, x * 10)))
                .unwrap();
            assert_eq!(out, vec![(0, 10), (1, 20), (2, 30), (3, 40)]);
        }
    }

    #[test]
    fn test_worker_pool_threads_are_named() {
        let scheduler = Scheduler::new(2).unwrap();
        let names = scheduler
            .run_tasks(&scope(Placement::WorkerPool), vec![(); 4], |_, _| {
                Ok(std::thread::current().name().map(str::to_string))
            })
            .unwrap();
        assert!(
            names
                .iter()
                .all(|n| n.as_deref().is_some_and(|n| n.starts_with("partflow-worker-")))
        );
    }

    #[test]
    fn test_task_error_becomes_execution_failure() {
        let scheduler = Scheduler::new(2).unwrap();
        let err = scheduler
            .run_tasks(&scope(Placement::Local), vec![0, 1, 2], |_, x| {
                if x == 1 {
                    Err(EngineError::invalid_argument("bad element"))
                } else {
                    Ok(x)
                }
            })
            .unwrap_err();

        match err {
            EngineError::ExecutionFailure {
                stage_id,
                operator,
                partition,
                ..
            } => {
                assert_eq!(stage_id, 9);
                assert_eq!(operator, "map");
                assert_eq!(partition, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_panic_becomes_execution_failure() {
        let scheduler = Scheduler::new(2).unwrap();
        let err = scheduler
            .run_tasks(&scope(Placement::WorkerPool), vec![0, 1], |_, x: i32| {
                if x == 1 {
                    panic!("boom");
                }
                Ok(x)
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_background_jobs_run_off_the_worker_pool() {
        let scheduler = Scheduler::new(1).unwrap();
        let (sender, receiver) = std::sync::mpsc::channel();
        scheduler.spawn(move || {
            sender
                .send(std::thread::current().name().map(str::to_string))
                .unwrap();
        });
        let name = receiver.recv().unwrap().unwrap();
        assert!(name.starts_with("partflow-job-"), "{}", name);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert_eq!(
            Scheduler::new(0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
