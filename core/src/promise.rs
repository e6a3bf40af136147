//! One-shot asynchronous value handles.
//!
//! A `ValuePromise` is returned as soon as an asynchronous request is
//! submitted. Its producer holds the matching `PromiseResolver` and settles
//! it exactly once, either with a value or with an error.

use crate::traits::{EngineError, EngineResult};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

enum PromiseState<T> {
    Pending,
    Resolved(Arc<T>),
    Failed(Arc<EngineError>),
    Abandoned,
}

struct PromiseCell<T> {
    state: Mutex<PromiseState<T>>,
    ready: Condvar,
}

impl<T> PromiseCell<T> {
    fn lock(&self) -> MutexGuard<'_, PromiseState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, next: PromiseState<T>) -> EngineResult<()> {
        let mut state = self.lock();
        if !matches!(*state, PromiseState::Pending) {
            return Err(EngineError::illegal_state("promise already resolved"));
        }
        *state = next;
        self.ready.notify_all();
        Ok(())
    }
}

fn outcome<T>(state: &PromiseState<T>) -> Option<EngineResult<Arc<T>>> {
    match state {
        PromiseState::Pending => None,
        PromiseState::Resolved(value) => Some(Ok(Arc::clone(value))),
        PromiseState::Failed(err) => Some(Err(EngineError::Shared(Arc::clone(err)))),
        PromiseState::Abandoned => Some(Err(EngineError::illegal_state(
            "promise producer dropped without resolving",
        ))),
    }
}

/// Consumer side of a one-shot value.
pub struct ValuePromise<T> {
    cell: Arc<PromiseCell<T>>,
}

impl<T> Clone for ValuePromise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for ValuePromise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuePromise")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T> ValuePromise<T> {
    /// Create an unresolved promise and the resolver that settles it.
    pub fn channel() -> (ValuePromise<T>, PromiseResolver<T>) {
        let cell = Arc::new(PromiseCell {
            state: Mutex::new(PromiseState::Pending),
            ready: Condvar::new(),
        });
        (
            ValuePromise {
                cell: Arc::clone(&cell),
            },
            PromiseResolver { cell },
        )
    }

    /// A promise that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::channel();
        resolver.resolve(value).ok();
        promise
    }

    /// Block until the promise is settled.
    ///
    /// Every call after resolution returns the same `Arc`.
    pub fn get(&self) -> EngineResult<Arc<T>> {
        let mut state = self.cell.lock();
        loop {
            if let Some(result) = outcome(&state) {
                return result;
            }
            state = self
                .cell
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `get`, but gives up after `timeout` and returns `Ok(None)`.
    pub fn get_timeout(&self, timeout: Duration) -> EngineResult<Option<Arc<T>>> {
        let state = self.cell.lock();
        let (state, _) = self
            .cell
            .ready
            .wait_timeout_while(state, timeout, |s| matches!(s, PromiseState::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        outcome(&state).transpose()
    }

    /// Non-blocking check; `Ok(None)` while pending.
    pub fn try_get(&self) -> EngineResult<Option<Arc<T>>> {
        outcome(&self.cell.lock()).transpose()
    }

    /// True once the promise holds a value or an error.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.cell.lock(), PromiseState::Pending)
    }
}

/// Producer side of a `ValuePromise`.
///
/// Dropping an unsettled resolver wakes every waiter with `IllegalState`.
pub struct PromiseResolver<T> {
    cell: Arc<PromiseCell<T>>,
}

impl<T> PromiseResolver<T> {
    pub fn resolve(&self, value: T) -> EngineResult<()> {
        self.cell.settle(PromiseState::Resolved(Arc::new(value)))
    }

    pub fn fail(&self, error: EngineError) -> EngineResult<()> {
        self.cell.settle(PromiseState::Failed(Arc::new(error)))
    }

    /// Settle with the outcome of a computation.
    pub fn complete(&self, result: EngineResult<T>) -> EngineResult<()> {
        match result {
            Ok(value) => self.resolve(value),
            Err(error) => self.fail(error),
        }
    }
}

impl<T> Drop for PromiseResolver<T> {
    fn drop(&mut self) {
        let mut state = self.cell.lock();
        if matches!(*state, PromiseState::Pending) {
            *state = PromiseState::Abandoned;
            self.cell.ready.notify_all();
        }
    }
}
