use async_trait::async_trait;
use record_relay::config::{self, Config, StoreBackend};
use record_relay::db::{self, BaseRecord};
use record_relay::gateway::GatewayError;
use record_relay::model::{JobType, OperationKind};
use record_relay::queue::{JobOptions, JobOutcome, JobSubmitter, QueueError};
use record_relay::relay::Relay;
use record_relay::store::MemoryStore;
use record_relay::upstream::{
    ApiConnector, ApiFailure, NewRecord, QueryOptions, Record, RecordUpdate, RecordsApi,
};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
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

async fn add_base(pool: &sqlx::SqlitePool, base_id: &str, rpm: i64, is_active: bool) {
    db::upsert_base(
        pool,
        &BaseRecord {
            base_id: base_id.into(),
            name: base_id.into(),
            api_key: "key".into(),
            rate_limit_rpm: rpm,
            is_active,
        },
    )
    .await
    .unwrap();
}

/// Remembers the size of every create call it receives.
#[derive(Default)]
struct RecordingApi {
    creates: Mutex<Vec<usize>>,
}

#[async_trait]
impl RecordsApi for RecordingApi {
    async fn create(&self, _resource_id: &str, records: &[NewRecord]) -> Result<Vec<Record>, ApiFailure> {
        let mut creates = self.creates.lock().unwrap();
        let offset = creates.iter().sum::<usize>();
        creates.push(records.len());
        Ok(records
            .iter()
            .enumerate()
            .map(|(i, r)| Record {
                id: format!("rec{}", offset + i),
                fields: r.fields.clone(),
                created_time: None,
                comment_count: None,
                deleted: false,
            })
            .collect())
    }

    async fn update(&self, _: &str, _: &[RecordUpdate]) -> Result<Vec<Record>, ApiFailure> {
        Err(ApiFailure::new(Some(422), Some("INVALID_REQUEST_UNKNOWN"), "not scripted"))
    }

    async fn delete(&self, _: &str, _: &[String]) -> Result<Vec<Record>, ApiFailure> {
        Err(ApiFailure::new(Some(422), Some("INVALID_REQUEST_UNKNOWN"), "not scripted"))
    }

    async fn query(&self, _: &str, _: &QueryOptions) -> Result<Vec<Record>, ApiFailure> {
        Ok(Vec::new())
    }

    async fn get(&self, _: &str, _: &str) -> Result<Record, ApiFailure> {
        Err(ApiFailure::new(Some(404), Some("NOT_FOUND"), "not scripted"))
    }
}

struct SharedConnector(Arc<RecordingApi>);

impl ApiConnector for SharedConnector {
    fn connect(&self, _base: &BaseRecord) -> Result<Arc<dyn RecordsApi>, ApiFailure> {
        let api: Arc<dyn RecordsApi> = self.0.clone();
        Ok(api)
    }
}

fn rows(n: usize) -> Vec<Map<String, Value>> {
    (0..n)
        .map(|i| {
            let mut fields = Map::new();
            fields.insert("Name".into(), json!(format!("row {}", i)));
            fields
        })
        .collect()
}

struct TestRelay {
    pool: sqlx::SqlitePool,
    api: Arc<RecordingApi>,
    relay: Relay,
}

impl std::ops::Deref for TestRelay {
    type Target = Relay;

    fn deref(&self) -> &Relay {
        &self.relay
    }
}

async fn relay(flush_interval: Duration) -> TestRelay {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.coordination.backend = StoreBackend::Memory;
    cfg.coordination.path = None;
    cfg.app.poll_interval_ms = 10;
    cfg.upstream.base_delay_ms = 5;
    cfg.batching.flush_interval_ms = flush_interval.as_millis() as u64;

    let pool = setup_pool().await;
    let api = Arc::new(RecordingApi::default());
    let relay = Relay::build(
        &cfg,
        pool.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(SharedConnector(api.clone())),
    );
    relay.start().await.unwrap();
    TestRelay { pool, api, relay }
}

#[tokio::test]
async fn twelve_creates_become_two_batches() {
    let relay = relay(Duration::from_secs(60)).await;
    add_base(&relay.pool, "B1", 600, true).await;

    let first = relay
        .gateway
        .submit_creates("B1", "T1", rows(10))
        .await
        .unwrap();
    assert_eq!(first.operations.len(), 10);
    assert_eq!(first.batch_id, "batch:B1:T1:create");
    let jobs = db::list_jobs_for_base(&relay.pool, "B1", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let full_job = jobs[0].id.clone();

    let second = relay
        .gateway
        .submit_creates("B1", "T1", rows(2))
        .await
        .unwrap();
    assert_eq!(second.queue_position, 2);
    let status = relay
        .gateway
        .batch_status("B1", "T1", OperationKind::Create)
        .await
        .unwrap();
    assert_eq!(status.size, 2);
    assert!(status.oldest_operation_timestamp.is_some());

    let flushed = relay
        .gateway
        .flush_batch("B1", "T1", OperationKind::Create)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flushed.size, 2);

    for (job_id, count) in [(full_job, 10), (flushed.job_id, 2)] {
        let outcome = tokio::time::timeout(Duration::from_secs(5), relay.queue.wait_for(&job_id))
            .await
            .unwrap()
            .unwrap();
        match outcome {
            JobOutcome::Completed(result) => assert_eq!(result["count"], count),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    let mut sizes = relay.api.creates.lock().unwrap().clone();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![2, 10]);

    // One admission check per call, plus one upstream call per batch.
    let metrics = relay.gateway.metrics("B1").await;
    assert_eq!(metrics.requests_per_minute, 4);
    assert_eq!(metrics.error_rate, 0.0);
    relay.shutdown().await;
}

#[tokio::test]
async fn partial_batch_flushes_on_its_own() {
    let relay = relay(Duration::from_millis(200)).await;
    add_base(&relay.pool, "B1", 600, true).await;

    relay
        .gateway
        .submit_creates("B1", "T1", rows(3))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let jobs = db::list_jobs_for_base(&relay.pool, "B1", 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let outcome = tokio::time::timeout(Duration::from_secs(5), relay.queue.wait_for(&jobs[0].id))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(*relay.api.creates.lock().unwrap(), vec![3]);
    relay.shutdown().await;
}

#[tokio::test]
async fn gateway_rejects_bad_requests() {
    let relay = relay(Duration::from_secs(60)).await;
    add_base(&relay.pool, "B1", 60, true).await;
    add_base(&relay.pool, "OFF", 600, false).await;

    let err = relay
        .gateway
        .submit_creates("B1", "T1", rows(11))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));

    let err = relay
        .gateway
        .submit_deletes("B1", "T1", vec!["".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));

    let err = relay
        .gateway
        .submit_creates("OFF", "T1", rows(1))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BaseUnavailable(_)));

    let err = relay
        .gateway
        .submit_creates("missing", "T1", rows(1))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BaseUnavailable(_)));

    // 60 rpm leaves one token per second.
    relay
        .gateway
        .submit_deletes("B1", "T1", vec!["rec1".into()])
        .await
        .unwrap();
    let err = relay
        .gateway
        .submit_deletes("B1", "T1", vec!["rec2".into()])
        .await
        .unwrap_err();
    match err {
        GatewayError::RateLimited {
            base_id,
            retry_after_secs,
        } => {
            assert_eq!(base_id, "B1");
            assert_eq!(retry_after_secs, 60);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let status = relay
        .gateway
        .batch_status("B1", "T1", OperationKind::Delete)
        .await
        .unwrap();
    assert_eq!(status.size, 1);
    relay.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_timers_and_keeps_operations() {
    let relay = relay(Duration::from_secs(60)).await;
    add_base(&relay.pool, "B1", 600, true).await;

    relay
        .gateway
        .submit_creates("B1", "T1", rows(3))
        .await
        .unwrap();
    assert_eq!(relay.batcher.pending_flushes(), 1);

    relay.shutdown().await;
    assert_eq!(relay.batcher.pending_flushes(), 0);
    let err = relay
        .queue
        .submit(JobType::BatchDispatch, "B1", json!({}), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Closed));

    let status = relay
        .gateway
        .batch_status("B1", "T1", OperationKind::Create)
        .await
        .unwrap();
    assert_eq!(status.size, 3);
    assert!(db::list_jobs_for_base(&relay.pool, "B1", 10)
        .await
        .unwrap()
        .is_empty());
}
