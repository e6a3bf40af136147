//! Per-key combining logic used by keyed shuffles.

use std::sync::Arc;

/// Combines the values of one key.
///
/// V: input value type
/// C: combiner (output) type
pub trait Aggregator<V, C>: Send + Sync {
    /// Create a combiner from the first value of a key.
    fn create_combiner(&self, v: V) -> C;

    /// Merge a further value into a combiner.
    fn merge_value(&self, c: C, v: V) -> C;

    /// Merge two combiners built on different partitions.
    fn merge_combiners(&self, c1: C, c2: C) -> C;
}

/// Combiner and value types coincide; used by `reduce_by_key`.
pub struct ReduceAggregator<V> {
    reduce: Arc<dyn Fn(V, V) -> V + Send + Sync>,
}

impl<V> ReduceAggregator<V> {
    pub fn new(reduce: impl Fn(V, V) -> V + Send + Sync + 'static) -> Self {
        Self {
            reduce: Arc::new(reduce),
        }
    }
}

impl<V> Aggregator<V, V> for ReduceAggregator<V> {
    fn create_combiner(&self, v: V) -> V {
        v
    }

    fn merge_value(&self, c: V, v: V) -> V {
        (self.reduce)(c, v)
    }

    fn merge_combiners(&self, c1: V, c2: V) -> V {
        (self.reduce)(c1, c2)
    }
}

/// Collects the values of a key in encounter order.
#[derive(Debug, Default)]
pub struct GroupAggregator;

impl<V> Aggregator<V, Vec<V>> for GroupAggregator {
    fn create_combiner(&self, v: V) -> Vec<V> {
        vec![v]
    }

    fn merge_value(&self, mut c: Vec<V>, v: V) -> Vec<V> {
        c.push(v);
        c
    }

    fn merge_combiners(&self, mut c1: Vec<V>, mut c2: Vec<V>) -> Vec<V> {
        c1.append(&mut c2);
        c1
    }
}

/// Number of values per key.
#[derive(Debug, Default)]
pub struct CountAggregator;

impl<V> Aggregator<V, u64> for CountAggregator {
    fn create_combiner(&self, _v: V) -> u64 {
        1
    }

    fn merge_value(&self, c: u64, _v: V) -> u64 {
        c + 1
    }

    fn merge_combiners(&self, c1: u64, c2: u64) -> u64 {
        c1 + c2
    }
}

/// Keeps the first value seen for a key; backs `distinct`.
#[derive(Debug, Default)]
pub struct FirstAggregator;

impl<V> Aggregator<V, V> for FirstAggregator {
    fn create_combiner(&self, v: V) -> V {
        v
    }

    fn merge_value(&self, c: V, _v: V) -> V {
        c
    }

    fn merge_combiners(&self, c1: V, _c2: V) -> V {
        c1
    }
}

/// One side of a two-way join.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Side<V, W> {
    Left(V),
    Right(W),
}

/// Splits tagged values of a key back into their left and right lists.
#[derive(Debug, Default)]
pub struct CoGroupAggregator;

impl<V, W> Aggregator<Side<V, W>, (Vec<V>, Vec<W>)> for CoGroupAggregator {
    fn create_combiner(&self, v: Side<V, W>) -> (Vec<V>, Vec<W>) {
        <Self as Aggregator<Side<V, W>, (Vec<V>, Vec<W>)>>::merge_value(
            self,
            (Vec::new(), Vec::new()),
            v,
        )
    }

    fn merge_value(&self, (mut left, mut right): (Vec<V>, Vec<W>), v: Side<V, W>) -> (Vec<V>, Vec<W>) {
        match v {
            Side::Left(v) => left.push(v),
            Side::Right(w) => right.push(w),
        }
        (left, right)
    }

    fn merge_combiners(
        &self,
        (mut left, mut right): (Vec<V>, Vec<W>),
        (mut more_left, mut more_right): (Vec<V>, Vec<W>),
    ) -> (Vec<V>, Vec<W>) {
        left.append(&mut more_left);
        right.append(&mut more_right);
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_aggregator() {
        let sum = ReduceAggregator::new(|a: i32, b: i32| a + b);
        let c = sum.create_combiner(5);
        let c = sum.merge_value(c, 3);
        assert_eq!(sum.merge_combiners(c, 2), 10);
    }

    #[test]
    fn test_group_aggregator_keeps_order() {
        type Group<'a> = dyn Aggregator<&'a str, Vec<&'a str>>;
        let group: &Group<'_> = &GroupAggregator;
        let c = group.create_combiner("first");
        let c = group.merge_value(c, "second");
        let c = group.merge_combiners(c, vec!["third"]);
        assert_eq!(c, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_count_and_first() {
        let c = Aggregator::<char, u64>::create_combiner(&CountAggregator, 'a');
        let c = Aggregator::<char, u64>::merge_value(&CountAggregator, c, 'b');
        assert_eq!(Aggregator::<char, u64>::merge_combiners(&CountAggregator, c, 3), 5);

        let first = Aggregator::<i32, i32>::merge_value(&FirstAggregator, 1, 2);
        assert_eq!(Aggregator::<i32, i32>::merge_combiners(&FirstAggregator, first, 3), 1);
    }

    #[test]
    fn test_cogroup_splits_sides() {
        let cogroup: &dyn Aggregator<Side<i32, char>, (Vec<i32>, Vec<char>)> = &CoGroupAggregator;
        let c = cogroup.create_combiner(Side::Left(1));
        let c = cogroup.merge_value(c, Side::Right('x'));
        let c = cogroup.merge_combiners(c, (vec![2], vec!['y']));
        assert_eq!(c, (vec![1, 2], vec!['x', 'y']));
    }
}
