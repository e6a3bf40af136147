//! Building blocks of keyed shuffles.

pub mod aggregator;
pub(crate) mod combine;
pub mod partitioner;

pub use aggregator::{
    Aggregator, CoGroupAggregator, CountAggregator, FirstAggregator, GroupAggregator,
    ReduceAggregator, Side,
};
pub use partitioner::{HashPartitioner, Partitioner, RangePartitioner, sample_keys};
