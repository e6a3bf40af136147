//! partflow core - lazy partitioned datasets on a rayon worker pool
//!
//! A `FlowContext` creates source datasets; transformations build an
//! immutable stage graph and terminal actions evaluate it, shuffling by key
//! where needed. Intermediate structures live in named `Storage`s that are
//! checkpointed to a durable blob backend with `flush_data`.

pub mod cache;
pub mod config;
pub mod context;
pub mod dataset;
pub mod logging;
pub mod promise;
pub mod provider;
pub mod scheduler;
pub mod shuffle;
pub mod storage;
pub mod task;
pub mod traits;

pub use cache::CacheType;
pub use config::EngineConfig;
pub use context::FlowContext;
pub use dataset::{PairPartitionableDataset, PartitionableDataset, StageInfo};
pub use promise::{PromiseResolver, ValuePromise};
pub use provider::{
    DataSourceIteratorProvider, IndexedFileLineProvider, IndexedLine, RecursiveFileLineProvider,
    VecProvider,
};
pub use scheduler::Placement;
pub use storage::{Array, DataStream, Dictionary, Matrix, Storage, StorageManager};
pub use task::TaskDataContext;
pub use traits::{Data, EngineError, EngineResult, ErrorKind, Partition, StageId};

pub use partflow_common::{BlobBackend, CompressionAlgorithm};
