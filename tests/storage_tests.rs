use courier::log::{Log, PersistenceFlags};
use courier::storage::{DuckDbStorage, LogStorage};
use serde_json::json;
use std::collections::HashSet;
use tempfile::TempDir;

#[tokio::test]
async fn test_stored_logs_survive_reopen_and_claims_do_not() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("logs.duckdb");

    {
        let storage = DuckDbStorage::new(&db_path).unwrap();
        storage.init_schema().await.unwrap();
        for n in 0..3 {
            let log = Log::new("event", json!({ "n": n }));
            storage
                .save_log(&log, "analytics", PersistenceFlags::DEFAULT)
                .await
                .unwrap();
        }

        let batch = storage
            .load_batch("analytics", 10, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(batch.logs.len(), 3);
        assert!(batch.batch_id.is_some());
    }

    let storage = DuckDbStorage::new(&db_path).unwrap();
    storage.init_schema().await.unwrap();
    assert_eq!(storage.count_logs("analytics").await.unwrap(), 3);

    // the claim from the previous process is gone
    let batch = storage
        .load_batch("analytics", 2, &HashSet::new())
        .await
        .unwrap();
    let numbers: Vec<i64> = batch
        .logs
        .iter()
        .filter_map(|l| l.payload["n"].as_i64())
        .collect();
    assert_eq!(numbers, vec![0, 1]);
    assert!(batch.has_more);
}

#[tokio::test]
async fn test_capacity_applies_across_groups() {
    let storage = DuckDbStorage::in_memory().unwrap();
    storage.init_schema().await.unwrap();
    storage.set_capacity(2).await.unwrap();

    for group in ["analytics", "crashes", "analytics"] {
        storage
            .save_log(&Log::new("event", json!({})), group, PersistenceFlags::DEFAULT)
            .await
            .unwrap();
    }

    let total = storage.count_logs("analytics").await.unwrap()
        + storage.count_logs("crashes").await.unwrap();
    assert_eq!(total, 2);
}
