//! Integration tests for keyed datasets and shuffles.

mod common;

use common::{create_test_context, create_test_string_i32_data, sorted};
use partflow_core::traits::{EngineError, ErrorKind};
use std::collections::HashMap;

fn s(value: &str) -> String {
    value.to_string()
}

#[test]
fn test_reduce_by_key() {
    let ctx = create_test_context("reduce-by-key");
    let reduced = ctx
        .parallelize_pairs(vec![(s("a"), 1), (s("b"), 2), (s("a"), 3)])
        .reduce_by_key(|a, b| a + b)
        .unwrap();

    let expected: HashMap<String, i32> = [(s("a"), 4), (s("b"), 2)].into_iter().collect();
    assert_eq!(reduced.collect_as_map().unwrap(), expected);
    // one pair per key
    assert_eq!(reduced.count().unwrap(), 2);
}

#[test]
fn test_reduce_by_key_is_independent_of_partitioning() {
    let ctx = create_test_context("reduce-partitioning");
    let pairs = ctx.parallelize_pairs(create_test_string_i32_data());
    let baseline = pairs.reduce_by_key(|a, b| a + b).unwrap().collect_as_map().unwrap();
    assert_eq!(baseline[&s("a")], 10);

    for size in [1, 2, 4, 100] {
        let regrouped = pairs.with_partition_size(size).unwrap();
        let result = regrouped.reduce_by_key(|a, b| a + b).unwrap().collect_as_map().unwrap();
        assert_eq!(result, baseline, "with partition size {}", size);
    }
}

#[test]
fn test_group_by_key_keeps_encounter_order() {
    let ctx = create_test_context("group-by-key");
    let grouped = ctx
        .parallelize_pairs(create_test_string_i32_data())
        .group_by_key()
        .unwrap()
        .collect_as_map()
        .unwrap();

    assert_eq!(grouped[&s("a")], vec![1, 3, 6]);
    assert_eq!(grouped[&s("b")], vec![2, 5]);
    assert_eq!(grouped[&s("c")], vec![4]);
}

#[test]
fn test_group_then_flatten_is_a_permutation() {
    let ctx = create_test_context("group-flatten");
    let data = create_test_string_i32_data();
    let flattened: Vec<(String, i32)> = ctx
        .parallelize_pairs(data.clone())
        .group_by_key()
        .unwrap()
        .as_dataset()
        .flat_map(|(k, vs)| vs.into_iter().map(move |v| (k.clone(), v)))
        .collect()
        .unwrap();
    assert_eq!(sorted(flattened), sorted(data));
}

#[test]
fn test_sort_by_key_is_stable() {
    let ctx = create_test_context("sort");
    let pairs = ctx.parallelize_pairs(vec![
        (2, s("x")),
        (1, s("a")),
        (2, s("y")),
        (1, s("b")),
        (3, s("z")),
    ]);

    assert_eq!(
        pairs.sort_by_key(true).collect().unwrap(),
        vec![
            (1, s("a")),
            (1, s("b")),
            (2, s("x")),
            (2, s("y")),
            (3, s("z")),
        ]
    );
    assert_eq!(
        pairs.sort_by_key(false).collect().unwrap(),
        vec![
            (3, s("z")),
            (2, s("x")),
            (2, s("y")),
            (1, s("a")),
            (1, s("b")),
        ]
    );
}

#[test]
fn test_sort_by_key_over_many_partitions() {
    let ctx = create_test_context("sort-many");
    let data: Vec<(i32, i32)> = (0..200).map(|i| ((i * 37) % 101, i)).collect();
    let keys: Vec<i32> = ctx
        .parallelize_pairs(data.clone())
        .sort_by_key(true)
        .keys()
        .collect()
        .unwrap();

    let mut expected: Vec<i32> = data.iter().map(|(k, _)| *k).collect();
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn test_join_emits_cross_product() {
    let ctx = create_test_context("join");
    let left = ctx.parallelize_pairs(vec![(1, s("a")), (1, s("b")), (2, s("c"))]);
    let right = ctx.parallelize_pairs(vec![(1, s("x")), (1, s("y")), (3, s("z"))]);

    let joined = sorted(left.join(&right).unwrap().collect().unwrap());
    assert_eq!(
        joined,
        vec![
            (1, (s("a"), s("x"))),
            (1, (s("a"), s("y"))),
            (1, (s("b"), s("x"))),
            (1, (s("b"), s("y"))),
        ]
    );
}

#[test]
fn test_join_with_disjoint_keys_is_empty() {
    let ctx = create_test_context("join-disjoint");
    let left = ctx.parallelize_pairs(vec![(1, 10)]);
    let right = ctx.parallelize_pairs(vec![(2, 20)]);
    assert_eq!(left.join(&right).unwrap().count().unwrap(), 0);
}

#[test]
fn test_map_values_commutes_with_values() {
    let ctx = create_test_context("map-values");
    let pairs = ctx.parallelize_pairs(create_test_string_i32_data());

    let mapped_then_projected = pairs.map_values(|v| v * 10).values().collect().unwrap();
    let projected_then_mapped = pairs.values().map(|v| v * 10).collect().unwrap();
    assert_eq!(mapped_then_projected, projected_then_mapped);

    let keys = pairs.map_values(|v| v + 1).keys().collect().unwrap();
    assert_eq!(keys, pairs.keys().collect().unwrap());
}

#[test]
fn test_distinct_pairs() {
    let ctx = create_test_context("distinct-pairs");
    let pairs = ctx.parallelize_pairs(vec![(1, 1), (1, 2), (1, 1), (2, 1), (2, 1)]);
    let once = pairs.distinct().unwrap();
    assert_eq!(sorted(once.collect().unwrap()), vec![(1, 1), (1, 2), (2, 1)]);
    assert_eq!(
        sorted(once.distinct().unwrap().collect().unwrap()),
        vec![(1, 1), (1, 2), (2, 1)]
    );
}

#[test]
fn test_count_by_key_and_collect_as_map() {
    let ctx = create_test_context("count-by-key");
    let pairs = ctx.parallelize_pairs(create_test_string_i32_data());
    let counts = pairs.count_by_key().unwrap();
    assert_eq!(counts[&s("a")], 3);
    assert_eq!(counts[&s("b")], 2);
    assert_eq!(counts[&s("c")], 1);

    // later pairs win
    let map = pairs.collect_as_map().unwrap();
    assert_eq!(map[&s("a")], 6);
    assert_eq!(map[&s("b")], 5);
}

#[test]
fn test_key_by_and_map_pair() {
    let ctx = create_test_context("key-by");
    let words = ctx.parallelize(vec![s("apple"), s("avocado"), s("banana")]);

    let by_initial = words
        .key_by(|w| w.chars().next().unwrap_or_default())
        .group_by_key()
        .unwrap()
        .collect_as_map()
        .unwrap();
    assert_eq!(by_initial[&'a'], vec![s("apple"), s("avocado")]);

    let lengths = words
        .map_pair(|w| (w.len(), 1u32))
        .reduce_by_key(|a, b| a + b)
        .unwrap()
        .collect_as_map()
        .unwrap();
    assert_eq!(lengths[&5], 1);
    assert_eq!(lengths[&6], 1);
    assert_eq!(lengths[&7], 1);
}

#[test]
fn test_failing_reduce_names_the_key() {
    let ctx = create_test_context("reduce-failure");
    let err = ctx
        .parallelize_pairs(vec![(s("a"), 1), (s("a"), 2)])
        .reduce_by_key(|_, _| -> i32 { panic!("overflow") })
        .unwrap()
        .collect()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
    match err {
        EngineError::ExecutionFailure { operator, key, .. } => {
            assert_eq!(operator, "reduce_by_key");
            assert_eq!(key.as_deref(), Some("\"a\""));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_union_with_plain_pair_dataset() {
    let ctx = create_test_context("pair-union");
    let keyed = ctx.parallelize_pairs(vec![(s("a"), 1), (s("b"), 2)]);
    let plain = ctx.parallelize(vec![(s("a"), 3)]);

    let merged = keyed.union(&plain).reduce_by_key(|a, b| a + b).unwrap();
    assert_eq!(sorted(merged.collect().unwrap()), vec![(s("a"), 4), (s("b"), 2)]);

    let doubled = keyed.union(keyed.as_dataset());
    assert_eq!(doubled.count().unwrap(), 4);
}
