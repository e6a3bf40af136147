//! Integration tests for plain datasets: transformations, actions and
//! failure reporting.

mod common;

use common::{create_test_context, create_test_i32_data, sorted};
use partflow_core::scheduler::Placement;
use partflow_core::traits::{EngineError, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_narrow_chain_preserves_order() {
    let ctx = create_test_context("narrow-chain");
    let result = ctx
        .parallelize(create_test_i32_data())
        .map(|x| x * 2)
        .filter(|x| x % 3 != 0)
        .flat_map(|x| vec![x, -x])
        .collect()
        .unwrap();

    let expected: Vec<i32> = (1..=20)
        .map(|x| x * 2)
        .filter(|x| x % 3 != 0)
        .flat_map(|x| [x, -x])
        .collect();
    assert_eq!(result, expected);
}

#[test]
fn test_building_a_chain_runs_nothing() {
    let ctx = create_test_context("lazy");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let dataset = ctx.parallelize(vec![1, 2, 3]).map(move |x| {
        counter.fetch_add(1, Ordering::SeqCst);
        x
    });
    let _filtered = dataset.filter(|x| *x > 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(dataset.count().unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_map_partitions_sees_whole_partitions() {
    let ctx = create_test_context("map-partitions");
    let sums = ctx
        .parallelize((1..=7).collect::<Vec<i32>>())
        .map_partitions(|data| vec![data.iter().sum::<i32>()])
        .collect()
        .unwrap();
    // partitions of three: [1,2,3] [4,5,6] [7]
    assert_eq!(sums, vec![6, 15, 7]);
}

#[test]
fn test_reduce_is_independent_of_partitioning() {
    let ctx = create_test_context("reduce");
    for partitions in [1, 2, 5, 20] {
        let total = ctx
            .parallelize_with_partitions(create_test_i32_data(), partitions)
            .unwrap()
            .reduce(|a, b| a + b)
            .unwrap();
        assert_eq!(total, Some(210), "with {} partitions", partitions);
    }

    let empty = ctx.parallelize(Vec::<i32>::new()).reduce(|a, b| a + b).unwrap();
    assert_eq!(empty, None);
}

#[test]
fn test_take_first_and_contains() {
    let ctx = create_test_context("take");
    let dataset = ctx.parallelize(create_test_i32_data());
    assert_eq!(dataset.take(4).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(dataset.take(0).unwrap(), Vec::<i32>::new());
    assert_eq!(dataset.take(100).unwrap().len(), 20);
    assert_eq!(dataset.first().unwrap(), Some(1));
    assert!(dataset.contains(&17).unwrap());
    assert!(!dataset.contains(&21).unwrap());

    assert_eq!(ctx.parallelize(Vec::<i32>::new()).first().unwrap(), None);
}

#[test]
fn test_distinct_is_idempotent() {
    let ctx = create_test_context("distinct");
    let dataset = ctx.parallelize(vec![1, 2, 3, 2, 4, 3, 5, 1, 6, 4]);
    let once = dataset.distinct().unwrap();
    let twice = once.distinct().unwrap();

    assert_eq!(sorted(once.collect().unwrap()), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
        sorted(twice.collect().unwrap()),
        sorted(once.collect().unwrap())
    );
}

#[test]
fn test_union_keeps_duplicates_and_computes_shared_input_once() {
    let ctx = create_test_context("union");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let dataset = ctx.parallelize((1..=10).collect::<Vec<i32>>()).map(move |x| {
        counter.fetch_add(1, Ordering::SeqCst);
        x
    });

    let both = dataset.union(&dataset);
    let result = both.collect().unwrap();
    assert_eq!(result.len(), 20);
    assert_eq!(&result[..10], &result[10..]);
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[test]
fn test_with_partition_size_regroups_in_order() {
    let ctx = create_test_context("partition-size");
    let dataset = ctx.parallelize((1..=5).collect::<Vec<i32>>());
    let regrouped = dataset.with_partition_size(2).unwrap();
    assert_eq!(
        regrouped.collect_partitions().unwrap(),
        vec![vec![1, 2], vec![3, 4], vec![5]]
    );
    // the receiver keeps its own layout
    assert_eq!(
        dataset.collect_partitions().unwrap(),
        vec![vec![1, 2, 3], vec![4, 5]]
    );

    let err = dataset.with_partition_size(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_local_computation_gives_identical_results() {
    let ctx = create_test_context("local");
    let dataset = ctx.parallelize(create_test_i32_data());
    let local = dataset.enable_local_computation(true);
    let mapped = local.map(|x| x * x);

    assert!(local.is_local());
    assert_eq!(mapped.lineage()[0].placement, Placement::Local);
    assert_eq!(
        mapped.collect().unwrap(),
        dataset.map(|x| x * x).collect().unwrap()
    );
}

#[test]
fn test_lineage_lists_each_stage_once() {
    let ctx = create_test_context("lineage");
    let source = ctx.parallelize(vec![1, 2, 3]);
    let mapped = source.map(|x| x + 1);
    let both = mapped.union(&mapped);

    let lineage = both.lineage();
    let operators: Vec<&str> = lineage.iter().map(|s| s.operator).collect();
    assert_eq!(operators, vec!["union", "map", "source"]);
    assert_eq!(lineage[0].parents, vec![mapped.id(), mapped.id()]);
    assert_eq!(lineage[2].id, source.id());
    assert!(lineage[2].parents.is_empty());
}

#[test]
fn test_panicking_task_aborts_the_job() {
    let ctx = create_test_context("panic");
    let dataset = ctx.parallelize(vec![1, 2, 3, 4]).map(|x| {
        if x == 3 {
            panic!("cannot map 3");
        }
        x
    });

    match dataset.collect().unwrap_err() {
        EngineError::ExecutionFailure {
            operator,
            partition,
            source,
            ..
        } => {
            assert_eq!(operator, "map");
            assert_eq!(partition, 0);
            assert!(source.to_string().contains("cannot map 3"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_stopped_context_refuses_jobs() {
    let ctx = create_test_context("stopped");
    let dataset = ctx.parallelize(vec![1, 2, 3]).map(|x| x + 1);
    ctx.stop();

    assert_eq!(dataset.collect().unwrap_err().kind(), ErrorKind::IllegalState);
    assert_eq!(dataset.count().unwrap_err().kind(), ErrorKind::IllegalState);
}

#[test]
fn test_save_on_storage_manager_visits_every_element() {
    let ctx = create_test_context("save");
    ctx.storage_manager().create_storage("out").unwrap();

    let saved = ctx
        .parallelize((1..=7).collect::<Vec<i32>>())
        .save_on_storage_manager(|task, manager, x| {
            let storage = manager
                .get_storage("out")
                .ok_or_else(|| anyhow::anyhow!("storage out is missing"))?;
            let stream = storage.create_data_stream("seen")?;
            stream.append_value(&(task.partition_index(), *x))?;
            Ok(())
        });
    // lazy until an action runs
    let storage = ctx.storage_manager().get_storage("out").unwrap();
    assert!(!storage.contains_data_stream("seen"));

    assert_eq!(saved.collect().unwrap(), (1..=7).collect::<Vec<i32>>());

    let seen: Vec<(usize, i32)> = storage
        .get_data_stream("seen")
        .unwrap()
        .unwrap()
        .read_values()
        .unwrap();
    assert_eq!(seen.len(), 7);
    for partition in 0..3 {
        let values: Vec<i32> = seen
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, x)| *x)
            .collect();
        let start = partition as i32 * 3 + 1;
        let expected: Vec<i32> = (start..=(start + 2).min(7)).collect();
        assert_eq!(values, expected);
    }
}

#[test]
fn test_failing_procedure_names_the_element() {
    let ctx = create_test_context("save-failure");
    let err = ctx
        .parallelize((1..=7).collect::<Vec<i32>>())
        .save_on_storage_manager(|_, _, x| {
            if *x == 5 {
                anyhow::bail!("element {} rejected", x);
            }
            Ok(())
        })
        .materialize()
        .unwrap_err();

    match err {
        EngineError::ExecutionFailure {
            operator,
            partition,
            key,
            ..
        } => {
            assert_eq!(operator, "save_on_storage_manager");
            assert_eq!(partition, 1);
            assert_eq!(key.as_deref(), Some("5"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_async_actions_resolve_once() {
    let ctx = create_test_context("async");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let dataset = ctx.parallelize(create_test_i32_data()).map(move |x| {
        counter.fetch_add(1, Ordering::SeqCst);
        x
    });

    let promise = dataset.collect_async();
    let first = promise.get().unwrap();
    let second = promise.get().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*first, create_test_i32_data());
    assert_eq!(calls.load(Ordering::SeqCst), 20);

    assert_eq!(*dataset.count_async().get().unwrap(), 20);
}

#[test]
fn test_async_failure_reaches_every_caller() {
    let ctx = create_test_context("async-failure");
    ctx.stop();
    let promise = ctx.parallelize(vec![1]).count_async();
    for _ in 0..2 {
        assert_eq!(promise.get().unwrap_err().kind(), ErrorKind::IllegalState);
    }
}
