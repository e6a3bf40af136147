//! Integration tests for storages written by dataset jobs and checkpointed
//! to a durable backend.

mod common;

use common::create_test_context;
use partflow_core::config::EngineConfig;
use partflow_core::context::FlowContext;
use partflow_core::storage::StorageManager;
use partflow_core::traits::{EngineError, ErrorKind};
use partflow_core::{BlobBackend, CompressionAlgorithm};
use partflow_common::BlobStoreBuilder;

#[test]
fn test_matrix_dimensions_are_fixed_at_creation() {
    let ctx = create_test_context("matrix");
    let storage = ctx.storage_manager().create_storage("work").unwrap();
    let matrix = storage.create_matrix::<f64>("m", 2, 3).unwrap();
    matrix.set(1, 2, 4.5).unwrap();

    let again = storage.create_matrix::<f64>("m", 2, 3).unwrap();
    assert_eq!(again.get(1, 2), Some(4.5));

    match storage.create_matrix::<f64>("m", 4, 4).unwrap_err() {
        EngineError::DimensionMismatch {
            existing,
            requested,
            ..
        } => {
            assert_eq!(existing, (2, 3));
            assert_eq!(requested, (4, 4));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        storage.get_matrix::<i64>("m").unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_jobs_fill_storage_structures() {
    let ctx = create_test_context("fill");
    let storage = ctx.storage_manager().create_storage("stats").unwrap();
    storage.create_array::<u64>("squares").unwrap().resize(10, 0);

    ctx.parallelize((0..10u64).collect::<Vec<u64>>())
        .save_on_storage_manager(|_, manager, x| {
            let storage = manager
                .get_storage("stats")
                .ok_or_else(|| anyhow::anyhow!("storage stats is missing"))?;
            storage.create_array::<u64>("squares")?.set(*x as usize, x * x)?;
            storage
                .create_dictionary("seen")?
                .put(format!("n{}", x), &(*x % 2 == 0))?;
            Ok(())
        })
        .materialize()
        .unwrap();

    let squares = storage.get_array::<u64>("squares").unwrap().unwrap();
    assert_eq!(squares.to_vec(), (0..10u64).map(|x| x * x).collect::<Vec<_>>());
    let seen = storage.get_dictionary("seen").unwrap().unwrap();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.get::<bool>("n4").unwrap(), Some(true));
    assert_eq!(seen.get::<bool>("n7").unwrap(), Some(false));
}

#[tokio::test]
async fn test_compressed_storage_round_trips_through_flush() {
    let dir = tempfile::tempdir().unwrap();
    let backend = BlobBackend::LocalFileSystem {
        root_path: dir.path().to_string_lossy().into_owned(),
    };
    let config = EngineConfig::new("durable")
        .with_num_workers(2)
        .with_backend(backend.clone())
        .with_compression(CompressionAlgorithm::Zstd);
    let ctx = FlowContext::new(config).unwrap();

    let storage = ctx.storage_manager().create_storage("results").unwrap();
    storage
        .create_array::<String>("names")
        .unwrap()
        .extend(["ada".to_string(), "grace".to_string()]);
    storage.create_matrix::<i32>("grid", 2, 2).unwrap().set(0, 1, 7).unwrap();
    storage.create_data_stream("log").unwrap().append(b"started".to_vec());

    let manager = ctx.storage_manager_handle();
    assert!(manager.flush_all().await.unwrap() >= 3);
    // nothing changed since the last checkpoint
    assert_eq!(manager.flush_all().await.unwrap(), 0);

    let blobs = BlobStoreBuilder::new()
        .backend(backend)
        .compression(CompressionAlgorithm::Zstd)
        .build()
        .unwrap();
    let reopened = StorageManager::new(blobs)
        .open_storage("results")
        .await
        .unwrap();
    assert_eq!(
        reopened.get_array::<String>("names").unwrap().unwrap().to_vec(),
        vec!["ada", "grace"]
    );
    let grid = reopened.get_matrix::<i32>("grid").unwrap().unwrap();
    assert_eq!(grid.to_rows(), vec![vec![0, 7], vec![0, 0]]);
    assert_eq!(
        reopened.get_data_stream("log").unwrap().unwrap().records(),
        vec![b"started".to_vec()]
    );
}
