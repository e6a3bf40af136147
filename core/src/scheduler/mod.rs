//! Task scheduling
//!
//! `pool` runs the tasks of one stage in parallel on rayon; `job` drives a
//! terminal evaluation through the stage graph.

pub mod job;
pub mod pool;

pub use job::JobRun;
pub use pool::{Placement, Scheduler, TaskScope};
