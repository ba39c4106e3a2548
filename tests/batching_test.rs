use record_relay::batcher::{BatchSettings, Batcher};
use record_relay::db;
use record_relay::model::{JobStatus, JobType, Operation, OperationKind};
use record_relay::queue::{QueueManager, QueueSettings};
use record_relay::store::{CoordinationStore, MemoryStore, SqliteStore};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn fields(n: i64) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("n".into(), json!(n));
    map
}

#[tokio::test]
async fn interval_flush_produces_one_job() {
    let pool = setup_pool().await;
    let queue = Arc::new(QueueManager::new(pool.clone(), QueueSettings::default()));
    let batcher = Batcher::new(
        Arc::new(MemoryStore::new()),
        queue.clone(),
        BatchSettings::default(),
    );

    for n in 0..3 {
        batcher
            .enqueue(&Operation::create("B1", "T1", fields(n)))
            .await
            .unwrap();
    }
    assert!(db::list_jobs_for_base(&pool, "B1", 10).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let jobs = db::list_jobs_for_base(&pool, "B1", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.job_type, JobType::BatchDispatch);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.data["batch_size"], 3);
    assert_eq!(job.data["resource_id"], "T1");
    assert_eq!(job.data["kind"], "create");
    let ns: Vec<_> = job.data["operations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|op| op["data"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(ns, vec![0, 1, 2]);

    let status = batcher
        .batch_status("B1", "T1", OperationKind::Create)
        .await
        .unwrap();
    assert_eq!(status.size, 0);
    assert_eq!(status.oldest_operation_timestamp, None);
}

#[tokio::test]
async fn keys_accumulate_separately() {
    let pool = setup_pool().await;
    let queue = Arc::new(QueueManager::new(pool.clone(), QueueSettings::default()));
    let batcher = Batcher::new(
        Arc::new(MemoryStore::new()),
        queue,
        BatchSettings {
            max_batch_size: 2,
            flush_interval: Duration::from_secs(60),
            ..BatchSettings::default()
        },
    );

    batcher
        .enqueue(&Operation::create("B1", "T1", fields(1)))
        .await
        .unwrap();
    batcher
        .enqueue(&Operation::delete("B1", "T1", "rec1"))
        .await
        .unwrap();
    batcher
        .enqueue(&Operation::create("B1", "T2", fields(2)))
        .await
        .unwrap();
    assert!(db::list_jobs_for_base(&pool, "B1", 10).await.unwrap().is_empty());

    // Second delete fills its own list.
    let receipt = batcher
        .enqueue(&Operation::delete("B1", "T1", "rec2"))
        .await
        .unwrap();
    assert_eq!(receipt.queue_position, 2);
    assert_eq!(receipt.estimated_wait_ms, 0);

    let jobs = db::list_jobs_for_base(&pool, "B1", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].data["kind"], "delete");
    assert_eq!(jobs[0].priority, 3);

    for (resource, kind, size) in [
        ("T1", OperationKind::Create, 1),
        ("T1", OperationKind::Delete, 0),
        ("T2", OperationKind::Create, 1),
    ] {
        let status = batcher.batch_status("B1", resource, kind).await.unwrap();
        assert_eq!(status.size, size, "{} {}", resource, kind);
    }
    batcher.destroy();
}

#[tokio::test]
async fn instances_sharing_a_store_share_batches() {
    let td = tempfile::tempdir().unwrap();
    let path = td.path().join("coordination.db");
    let pool = setup_pool().await;
    let queue = Arc::new(QueueManager::new(pool.clone(), QueueSettings::default()));

    let store_a: Arc<dyn CoordinationStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let store_b: Arc<dyn CoordinationStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let settings = BatchSettings {
        max_batch_size: 4,
        flush_interval: Duration::from_secs(60),
        ..BatchSettings::default()
    };
    let a = Batcher::new(store_a, queue.clone(), settings.clone());
    let b = Batcher::new(store_b, queue, settings);

    for n in 0..2 {
        a.enqueue(&Operation::create("B1", "T1", fields(n))).await.unwrap();
        b.enqueue(&Operation::create("B1", "T1", fields(10 + n))).await.unwrap();
    }

    let jobs = db::list_jobs_for_base(&pool, "B1", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].data["batch_size"], 4);
    let ns: Vec<_> = jobs[0].data["operations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|op| op["data"]["n"].as_i64().unwrap())
        .collect();
    assert_eq!(ns, vec![0, 10, 1, 11]);
    a.destroy();
    b.destroy();
}
