//! Partitioners deciding which reduce partition receives a key.

use crate::traits::{EngineError, EngineResult};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub trait Partitioner<K>: Send + Sync {
    fn num_partitions(&self) -> usize;

    /// Index in `0..num_partitions()` for `key`.
    fn partition(&self, key: &K) -> usize;
}

/// Distributes keys by the hash of the key.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    num_partitions: usize,
    seed: u64,
}

impl HashPartitioner {
    pub fn new(num_partitions: usize) -> EngineResult<Self> {
        Self::with_seed(num_partitions, 0)
    }

    pub fn with_seed(num_partitions: usize, seed: u64) -> EngineResult<Self> {
        if num_partitions == 0 {
            return Err(EngineError::invalid_argument(
                "number of shuffle partitions must be positive",
            ));
        }
        Ok(Self {
            num_partitions,
            seed,
        })
    }
}

impl<K: Hash> Partitioner<K> for HashPartitioner {
    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn partition(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() % self.num_partitions as u64) as usize
    }
}

/// Distributes keys into contiguous sorted ranges so that concatenating the
/// partitions in index order yields a globally ordered result.
#[derive(Clone, Debug)]
pub struct RangePartitioner<K> {
    /// Upper bounds (inclusive) of every partition but the last, ascending.
    bounds: Vec<K>,
    ascending: bool,
}

impl<K: Ord + Clone> RangePartitioner<K> {
    /// Derive range bounds from a sample of the keys.
    ///
    /// Fewer than `num_partitions` ranges are produced when the sample has
    /// too few distinct keys.
    pub fn from_sample(num_partitions: usize, mut sample: Vec<K>, ascending: bool) -> Self {
        sample.sort();
        sample.dedup();

        let mut bounds = Vec::new();
        if num_partitions > 1 && !sample.is_empty() {
            let step = sample.len() as f64 / num_partitions as f64;
            for i in 1..num_partitions.min(sample.len()) {
                let index = ((i as f64 * step).ceil() as usize).saturating_sub(1);
                let Some(bound) = sample.get(index) else {
                    break;
                };
                if bounds.last() != Some(bound) {
                    bounds.push(bound.clone());
                }
            }
        }
        Self { bounds, ascending }
    }

    pub fn bounds(&self) -> &[K] {
        &self.bounds
    }
}

impl<K: Ord + Clone + Send + Sync> Partitioner<K> for RangePartitioner<K> {
    fn num_partitions(&self) -> usize {
        self.bounds.len() + 1
    }

    fn partition(&self, key: &K) -> usize {
        let index = match self.bounds.binary_search(key) {
            Ok(index) | Err(index) => index,
        };
        if self.ascending {
            index
        } else {
            self.bounds.len() - index
        }
    }
}

/// Up to `per_partition` evenly spaced keys from every partition.
pub fn sample_keys<K: Clone, V>(partitions: &[Vec<(K, V)>], per_partition: usize) -> Vec<K> {
    let mut sample = Vec::new();
    for data in partitions {
        if data.is_empty() || per_partition == 0 {
            continue;
        }
        let stride = data.len().div_ceil(per_partition);
        sample.extend(data.iter().step_by(stride).map(|(k, _)| k.clone()));
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_partitioner_is_stable() {
        let partitioner = HashPartitioner::new(4).unwrap();
        let p = partitioner.partition(&"key");
        assert!(p < 4);
        assert_eq!(partitioner.partition(&"key"), p);
        assert!(HashPartitioner::new(0).is_err());
    }

    #[test]
    fn test_range_partitioner_orders_ranges() {
        let partitioner = RangePartitioner::from_sample(3, (1..=9).rev().collect(), true);
        assert_eq!(Partitioner::<i32>::num_partitions(&partitioner), 3);
        assert_eq!(partitioner.bounds(), &[3, 6]);

        let parts: Vec<usize> = [0, 3, 4, 6, 7, 100]
            .iter()
            .map(|k| partitioner.partition(k))
            .collect();
        assert_eq!(parts, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_descending_range_partitioner_reverses_ranges() {
        let partitioner = RangePartitioner::from_sample(3, (1..=9).collect(), false);
        assert_eq!(partitioner.partition(&1), 2);
        assert_eq!(partitioner.partition(&9), 0);
    }

    #[test]
    fn test_range_partitioner_with_few_distinct_keys() {
        let partitioner = RangePartitioner::from_sample(8, vec![5, 5, 5], true);
        assert_eq!(Partitioner::<i32>::num_partitions(&partitioner), 1);
        assert_eq!(partitioner.partition(&42), 0);

        let empty = RangePartitioner::<i32>::from_sample(4, Vec::new(), true);
        assert_eq!(empty.partition(&1), 0);
    }

    #[test]
    fn test_sample_keys() {
        let partitions = vec![
            (0..10).map(|i| (i, ())).collect::<Vec<_>>(),
            Vec::new(),
            vec![(42, ())],
        ];
        let sample = sample_keys(&partitions, 5);
        assert_eq!(sample, vec![0, 2, 4, 6, 8, 42]);
    }
}
