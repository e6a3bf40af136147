//! Shared plumbing for the partflow workspace.
//!
//! Errors, the byte-level durable backend, payload
//! compression and the bounded memory cache used by the engine.

pub mod blob;
pub mod cache;
pub mod compression;
pub mod error;

pub use blob::{BatchOperation, BlobBackend, BlobStore, BlobStoreBuilder, BlobStoreStats};
pub use cache::{Cache, CacheBuilder, CacheStats};
pub use compression::{CompressionAlgorithm, CompressionBuilder, CompressionStats, Compressor};
pub use error::{CommonError, Result};
