//! Caching of materialized stages.
//!
//! A stage marked with `cache(CacheType)` is computed by the first terminal
//! action that reaches it; later actions read the retained partitions and
//! skip the stage's upstream.

pub mod cache_manager;
pub mod cache_type;

pub use cache_manager::{CacheManager, CacheManagerStats};
pub use cache_type::CacheType;
