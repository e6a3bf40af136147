//! Insertion-ordered per-key combining.

use super::Aggregator;
use crate::scheduler::TaskScope;
use crate::scheduler::pool::guard;
use crate::traits::EngineResult;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Combiners keyed by `K`, iterated in first-insertion order.
///
/// A panic inside the aggregator is reported as an `ExecutionFailure`
/// naming the key being combined.
pub(crate) struct CombineBuffer<K, C> {
    index: HashMap<K, usize>,
    entries: Vec<(K, Option<C>)>,
}

impl<K, C> CombineBuffer<K, C>
where
    K: Hash + Eq + Clone + Debug,
{
    pub(crate) fn new() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn merge_with<X>(
        &mut self,
        scope: &TaskScope,
        partition: usize,
        key: K,
        input: X,
        create: impl FnOnce(X) -> C,
        merge: impl FnOnce(C, X) -> C,
    ) -> EngineResult<()> {
        let failure = |key: &K, cause: anyhow::Error| {
            scope.failure(partition, Some(format!("{:?}", key)), cause)
        };
        match self.index.get(&key) {
            Some(&slot) => {
                let entry = &mut self.entries[slot];
                let Some(current) = entry.1.take() else {
                    return Err(failure(&key, anyhow::anyhow!("combiner lost after a failed merge")));
                };
                let merged = guard(|| merge(current, input)).map_err(|panic| failure(&key, panic))?;
                entry.1 = Some(merged);
            }
            None => {
                let created = guard(|| create(input)).map_err(|panic| failure(&key, panic))?;
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, Some(created)));
            }
        }
        Ok(())
    }

    /// Fold a raw value into the combiner of `key`.
    pub(crate) fn insert_value<V>(
        &mut self,
        aggregator: &dyn Aggregator<V, C>,
        scope: &TaskScope,
        partition: usize,
        key: K,
        value: V,
    ) -> EngineResult<()> {
        self.merge_with(
            scope,
            partition,
            key,
            value,
            |v| aggregator.create_combiner(v),
            |c, v| aggregator.merge_value(c, v),
        )
    }

    /// Fold a combiner produced by another map task into the combiner of `key`.
    pub(crate) fn merge_combiner<V>(
        &mut self,
        aggregator: &dyn Aggregator<V, C>,
        scope: &TaskScope,
        partition: usize,
        key: K,
        combiner: C,
    ) -> EngineResult<()> {
        self.merge_with(
            scope,
            partition,
            key,
            combiner,
            |c| c,
            |c1, c2| aggregator.merge_combiners(c1, c2),
        )
    }

    pub(crate) fn into_entries(self) -> Vec<(K, C)> {
        self.entries
            .into_iter()
            .filter_map(|(k, c)| c.map(|c| (k, c)))
            .collect()
    }
}
