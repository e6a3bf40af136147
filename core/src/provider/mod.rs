//! Data source iterator providers.
//!
//! A provider hands the engine an iterator over its items and advertises
//! optional capabilities through flags. Capabilities it does not support
//! report `false` and answer `Ok(None)`.

mod file;

pub use file::{IndexedFileLineProvider, IndexedLine, RecursiveFileLineProvider};

use crate::traits::{Data, EngineError, EngineResult};
use std::sync::Arc;

/// Boxed iterator returned by providers.
pub type ProviderIter<'a, T> = Box<dyn Iterator<Item = EngineResult<T>> + Send + 'a>;

pub trait DataSourceIteratorProvider<T>: Send + Sync {
    /// Iterate over every item from the beginning.
    fn iter(&self) -> EngineResult<ProviderIter<'_, T>>;

    fn size_enabled(&self) -> bool {
        false
    }

    /// Number of items, when `size_enabled`.
    fn size(&self) -> EngineResult<Option<u64>> {
        Ok(None)
    }

    fn contains_enabled(&self) -> bool {
        false
    }

    fn contains(&self, _item: &T) -> EngineResult<Option<bool>> {
        Ok(None)
    }

    fn take_enabled(&self) -> bool {
        false
    }

    /// Up to `count` items starting at position `start`, when `take_enabled`.
    fn take(&self, _start: u64, _count: u64) -> EngineResult<Option<Vec<T>>> {
        Ok(None)
    }
}

/// Provider over an in-memory vector.
pub struct VecProvider<T> {
    items: Arc<Vec<T>>,
    eq: Option<fn(&T, &T) -> bool>,
}

impl<T: Data> VecProvider<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
            eq: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Data + PartialEq> VecProvider<T> {
    /// Enable the `contains` capability.
    pub fn with_contains(mut self) -> Self {
        self.eq = Some(<T as PartialEq>::eq);
        self
    }
}

impl<T: Data> DataSourceIteratorProvider<T> for VecProvider<T> {
    fn iter(&self) -> EngineResult<ProviderIter<'_, T>> {
        Ok(Box::new(self.items.iter().cloned().map(Ok)))
    }

    fn size_enabled(&self) -> bool {
        true
    }

    fn size(&self) -> EngineResult<Option<u64>> {
        Ok(Some(self.items.len() as u64))
    }

    fn contains_enabled(&self) -> bool {
        self.eq.is_some()
    }

    fn contains(&self, item: &T) -> EngineResult<Option<bool>> {
        Ok(self.eq.map(|eq| self.items.iter().any(|x| eq(x, item))))
    }

    fn take_enabled(&self) -> bool {
        true
    }

    fn take(&self, start: u64, count: u64) -> EngineResult<Option<Vec<T>>> {
        let start = usize::try_from(start)
            .map_err(|_| EngineError::invalid_argument("take start out of range"))?;
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        Ok(Some(
            self.items.iter().skip(start).take(count).cloned().collect(),
        ))
    }
}
