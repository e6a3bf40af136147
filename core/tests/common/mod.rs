//! Common test utilities and helpers for integration tests

use partflow_core::config::EngineConfig;
use partflow_core::context::FlowContext;

/// Create a test context with a given name
pub fn create_test_context(name: &str) -> FlowContext {
    create_test_context_with_workers(name, 4)
}

/// Create a test context with a given worker count and small partitions,
/// so that even short inputs span several partitions.
pub fn create_test_context_with_workers(name: &str, workers: usize) -> FlowContext {
    let config = EngineConfig::new(name)
        .with_num_workers(workers)
        .with_default_partition_size(3)
        .with_shuffle_partitions(3);
    FlowContext::new(config).expect("test context")
}

/// Create test data for integer operations
#[allow(dead_code)]
pub fn create_test_i32_data() -> Vec<i32> {
    (1..=20).collect()
}

/// Create test data for key-value pairs (String, i32)
#[allow(dead_code)]
pub fn create_test_string_i32_data() -> Vec<(String, i32)> {
    vec![
        ("a".to_string(), 1),
        ("b".to_string(), 2),
        ("a".to_string(), 3),
        ("c".to_string(), 4),
        ("b".to_string(), 5),
        ("a".to_string(), 6),
    ]
}

/// Sort a collected result for order-insensitive comparisons
#[allow(dead_code)]
pub fn sorted<T: Ord>(mut items: Vec<T>) -> Vec<T> {
    items.sort();
    items
}
