//! Accumulates operations per (base, resource, kind) in the coordination store
//! and releases them to the job queue as bounded batches.

use crate::model::{BatchKey, JobType, Operation, OperationKind};
use crate::queue::{JobOptions, JobSubmitter, QueueError};
use crate::store::{CoordinationStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// What happens to a popped batch whose members do not share one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidBatchPolicy {
    #[default]
    Drop,
    Requeue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub batch_ttl: Duration,
    pub on_invalid: InvalidBatchPolicy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            flush_interval: Duration::from_millis(1000),
            batch_ttl: Duration::from_secs(300),
            on_invalid: InvalidBatchPolicy::Drop,
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("operation codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid batch composition: {0}")]
    InvalidComposition(String),
    #[error("expected 1 to {max} operations per call, got {got}")]
    InvalidSize { got: usize, max: usize },
    #[error("failed to submit batch job: {0}")]
    Submit(#[from] QueueError),
}

/// Answer to a single enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub batch_id: String,
    pub queue_position: usize,
    #[serde(rename = "estimatedWaitTime")]
    pub estimated_wait_ms: u64,
}

/// Answer to a multi-operation enqueue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub operations: Vec<Operation>,
    #[serde(rename = "estimatedWaitTime")]
    pub estimated_wait_ms: u64,
    pub queue_position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub size: usize,
    pub oldest_operation_timestamp: Option<i64>,
    #[serde(rename = "estimatedWaitTime")]
    pub estimated_wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch {
    pub job_id: String,
    pub size: usize,
}

struct FlushTimer {
    id: u64,
    handle: JoinHandle<()>,
}

pub struct Batcher {
    store: Arc<dyn CoordinationStore>,
    submitter: Arc<dyn JobSubmitter>,
    settings: BatchSettings,
    timers: Mutex<HashMap<String, FlushTimer>>,
    next_timer: AtomicU64,
    this: Weak<Batcher>,
}

impl fmt::Debug for Batcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("settings", &self.settings)
            .field("pending_timers", &self.lock_timers().len())
            .finish_non_exhaustive()
    }
}

/// Every member shares the first member's base, resource and kind.
/// An empty batch is not valid.
pub fn validate_batch(ops: &[Operation]) -> bool {
    match ops.first() {
        Some(first) => {
            let key = first.batch_key();
            ops.iter().all(|op| key.matches(op))
        }
        None => false,
    }
}

impl Batcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        submitter: Arc<dyn JobSubmitter>,
        settings: BatchSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            submitter,
            settings,
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, FlushTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn estimate_wait_ms(&self, size: usize) -> u64 {
        let max = self.settings.max_batch_size.max(1);
        if size >= max {
            return 0;
        }
        let batches_ahead = size.div_ceil(max) as u64;
        batches_ahead * self.settings.flush_interval.as_millis() as u64
    }

    /// Append `op` to its batch list. Reaching the size limit flushes right
    /// away; otherwise a flush is guaranteed within one interval.
    ///
    /// A size-triggered flush that finds a mixed batch returns
    /// `InvalidComposition`. Other flush failures leave `op` queued for the
    /// next timed flush and still return a receipt.
    #[instrument(skip_all, fields(batch = %op.batch_key()))]
    pub async fn enqueue(&self, op: &Operation) -> Result<EnqueueReceipt, BatchError> {
        let key = op.batch_key();
        let list = key.to_string();
        let payload = serde_json::to_string(op)?;
        let size = self
            .store
            .push_back(&list, payload, self.settings.batch_ttl)
            .await?;
        debug!(size, op_id = %op.id, "operation enqueued");

        if size >= self.settings.max_batch_size {
            if let Err(err) = self.flush_key(&key).await {
                error!(error = ?err, "size-triggered flush failed");
                self.reschedule_if_pending(&key).await;
                if matches!(err, BatchError::InvalidComposition(_)) {
                    return Err(err);
                }
            }
        } else {
            self.schedule_flush(&key);
        }

        Ok(EnqueueReceipt {
            batch_id: list,
            queue_position: size,
            estimated_wait_ms: self.estimate_wait_ms(size),
        })
    }

    /// Enqueue 1..=max_batch_size operations that share one batch key.
    pub async fn enqueue_many(&self, ops: Vec<Operation>) -> Result<BatchResult, BatchError> {
        if ops.is_empty() || ops.len() > self.settings.max_batch_size {
            return Err(BatchError::InvalidSize {
                got: ops.len(),
                max: self.settings.max_batch_size,
            });
        }
        if !validate_batch(&ops) {
            return Err(BatchError::InvalidComposition(
                "operations in one call must share base, resource and kind".into(),
            ));
        }

        let mut batch_id = String::new();
        let mut estimated_wait_ms = 0;
        let mut queue_position = 0;
        for op in &ops {
            let receipt = self.enqueue(op).await?;
            batch_id = receipt.batch_id;
            estimated_wait_ms = estimated_wait_ms.max(receipt.estimated_wait_ms);
            queue_position = receipt.queue_position;
        }
        Ok(BatchResult {
            batch_id,
            operations: ops,
            estimated_wait_ms,
            queue_position,
        })
    }

    pub async fn flush(
        &self,
        base_id: &str,
        resource_id: &str,
        kind: OperationKind,
    ) -> Result<Option<FlushedBatch>, BatchError> {
        self.flush_key(&BatchKey::new(base_id, resource_id, kind))
            .await
    }

    /// Pop up to one batch worth of operations and submit them as a single
    /// job. Flushing an empty key returns `Ok(None)`.
    #[instrument(skip_all, fields(batch = %key))]
    pub async fn flush_key(&self, key: &BatchKey) -> Result<Option<FlushedBatch>, BatchError> {
        let list = key.to_string();
        self.cancel_timer(&list);

        let raw = self
            .store
            .pop_front(&list, self.settings.max_batch_size)
            .await?;
        if raw.is_empty() {
            debug!("nothing to flush");
            return Ok(None);
        }

        let decoded: Result<Vec<Operation>, _> =
            raw.iter().map(|r| serde_json::from_str(r)).collect();
        let ops = match decoded {
            Ok(ops) if validate_batch(&ops) && key.matches(&ops[0]) => ops,
            other => {
                let reason = match other {
                    Err(err) => format!("undecodable operation: {}", err),
                    Ok(_) => "members do not share base, resource and kind".to_string(),
                };
                error!(
                    count = raw.len(),
                    reason = %reason,
                    policy = ?self.settings.on_invalid,
                    "invalid batch"
                );
                if self.settings.on_invalid == InvalidBatchPolicy::Requeue {
                    self.store
                        .push_front(&list, raw, self.settings.batch_ttl)
                        .await?;
                    self.schedule_flush(key);
                }
                return Err(BatchError::InvalidComposition(reason));
            }
        };

        let size = ops.len();
        let priority = ops.iter().map(|op| op.priority).max().unwrap_or(0);
        let data = json!({
            "operations": ops,
            "batch_size": size,
            "resource_id": key.resource_id,
            "kind": key.kind,
        });
        let options = JobOptions {
            priority: Some(priority),
            ..JobOptions::default()
        };

        let job = match self
            .submitter
            .submit(JobType::BatchDispatch, &key.base_id, data, options)
            .await
        {
            Ok(job) => job,
            Err(err) => {
                error!(error = ?err, count = size, "batch submission failed; operations returned");
                self.store
                    .push_front(&list, raw, self.settings.batch_ttl)
                    .await?;
                self.schedule_flush(key);
                return Err(BatchError::Submit(err));
            }
        };

        info!(
            base_id = %key.base_id,
            resource_id = %key.resource_id,
            kind = %key.kind,
            count = size,
            priority,
            job_id = %job.id,
            "batch flushed"
        );

        if self.store.len(&list).await? > 0 {
            self.schedule_flush(key);
        }
        Ok(Some(FlushedBatch { job_id: job.id, size }))
    }

    pub async fn batch_status(
        &self,
        base_id: &str,
        resource_id: &str,
        kind: OperationKind,
    ) -> Result<BatchStatus, BatchError> {
        let list = BatchKey::new(base_id, resource_id, kind).to_string();
        let size = self.store.len(&list).await?;
        let oldest_operation_timestamp = match self.store.front(&list).await? {
            Some(raw) => Some(serde_json::from_str::<Operation>(&raw)?.timestamp),
            None => None,
        };
        Ok(BatchStatus {
            size,
            oldest_operation_timestamp,
            estimated_wait_ms: self.estimate_wait_ms(size),
        })
    }

    /// Cancel every pending flush timer. Queued operations stay in the store.
    pub fn destroy(&self) {
        let mut timers = self.lock_timers();
        let count = timers.len();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        if count > 0 {
            debug!(count, "flush timers cancelled");
        }
    }

    fn schedule_flush(&self, key: &BatchKey) {
        let list = key.to_string();
        let mut timers = self.lock_timers();
        if timers.contains_key(&list) {
            return;
        }

        let id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let weak = self.this.clone();
        let delay = self.settings.flush_interval;
        let key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(batcher) = weak.upgrade() else {
                return;
            };
            batcher.release_timer(&key.to_string(), id);
            if let Err(err) = batcher.flush_key(&key).await {
                warn!(batch = %key, error = ?err, "timed flush failed");
                batcher.reschedule_if_pending(&key).await;
            }
        });
        timers.insert(list, FlushTimer { id, handle });
    }

    /// After a failed flush: keep a timer alive while operations remain. An
    /// unreadable list counts as non-empty.
    async fn reschedule_if_pending(&self, key: &BatchKey) {
        match self.store.len(&key.to_string()).await {
            Ok(0) => {}
            Ok(_) => self.schedule_flush(key),
            Err(err) => {
                warn!(batch = %key, error = ?err, "cannot read batch length; flush rescheduled");
                self.schedule_flush(key);
            }
        }
    }

    /// Flush timers currently armed.
    pub fn pending_flushes(&self) -> usize {
        self.lock_timers().len()
    }

    /// Forget the timer that is firing now, without aborting its own task.
    fn release_timer(&self, list: &str, id: u64) {
        let mut timers = self.lock_timers();
        if timers.get(list).is_some_and(|t| t.id == id) {
            timers.remove(list);
        }
    }

    fn cancel_timer(&self, list: &str) {
        if let Some(timer) = self.lock_timers().remove(list) {
            timer.handle.abort();
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackoffKind, Job, JobStatus};
    use crate::store::{BucketParams, MemoryStore, TokenGrant};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Map, Value};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingSubmitter {
        calls: AsyncMutex<Vec<(JobType, String, Value, JobOptions)>>,
        fail: bool,
    }

    #[async_trait]
    impl JobSubmitter for RecordingSubmitter {
        async fn submit(
            &self,
            job_type: JobType,
            base_id: &str,
            data: Value,
            options: JobOptions,
        ) -> Result<Job, QueueError> {
            if self.fail {
                return Err(QueueError::Closed);
            }
            let mut calls = self.calls.lock().await;
            calls.push((job_type, base_id.to_string(), data.clone(), options.clone()));
            Ok(Job {
                id: format!("job-{}", calls.len()),
                base_id: base_id.to_string(),
                job_type,
                status: JobStatus::Pending,
                priority: options.priority.unwrap_or(0),
                data,
                result: None,
                attempts: 0,
                max_attempts: 3,
                backoff_kind: BackoffKind::Exponential,
                backoff_ms: 2000,
                error_message: None,
                scheduled_at: Utc::now(),
                started_at: None,
                completed_at: None,
                created_at: Utc::now(),
            })
        }
    }

    fn setup(
        max: usize,
        interval_ms: u64,
        policy: InvalidBatchPolicy,
    ) -> (Arc<Batcher>, Arc<MemoryStore>, Arc<RecordingSubmitter>) {
        let store = Arc::new(MemoryStore::new());
        let submitter = Arc::new(RecordingSubmitter::default());
        let batcher = Batcher::new(
            store.clone(),
            submitter.clone(),
            BatchSettings {
                max_batch_size: max,
                flush_interval: Duration::from_millis(interval_ms),
                batch_ttl: Duration::from_secs(300),
                on_invalid: policy,
            },
        );
        (batcher, store, submitter)
    }

    fn create_op(n: i64) -> Operation {
        let mut fields = Map::new();
        fields.insert("n".into(), Value::from(n));
        Operation::create("B1", "T1", fields)
    }

    #[tokio::test]
    async fn full_batch_flushes_without_timer() {
        let (batcher, store, submitter) = setup(3, 60_000, InvalidBatchPolicy::Drop);
        let mut receipts = Vec::new();
        for n in 0..3 {
            receipts.push(batcher.enqueue(&create_op(n)).await.unwrap());
        }
        assert_eq!(receipts[0].estimated_wait_ms, 60_000);
        assert_eq!(receipts[2].queue_position, 3);
        assert_eq!(receipts[2].estimated_wait_ms, 0);
        assert_eq!(receipts[2].batch_id, "batch:B1:T1:create");

        let calls = submitter.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, JobType::BatchDispatch);
        assert_eq!(calls[0].2["batch_size"], 3);
        assert_eq!(store.len("batch:B1:T1:create").await.unwrap(), 0);
        assert!(batcher.lock_timers().is_empty());
    }

    #[tokio::test]
    async fn partial_batch_flushes_after_interval_in_order() {
        let (batcher, _store, submitter) = setup(10, 50, InvalidBatchPolicy::Drop);
        let ops: Vec<_> = (0..3).map(create_op).collect();
        for op in &ops {
            batcher.enqueue(op).await.unwrap();
        }
        assert!(submitter.calls.lock().await.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let calls = submitter.calls.lock().await;
        assert_eq!(calls.len(), 1);
        let ids: Vec<&str> = calls[0].2["operations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["id"].as_str().unwrap())
            .collect();
        let expected: Vec<&str> = ops.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn priority_is_highest_member() {
        let (batcher, _store, submitter) = setup(10, 60_000, InvalidBatchPolicy::Drop);
        batcher.enqueue(&create_op(1)).await.unwrap();
        batcher
            .enqueue(&create_op(2).with_priority(7))
            .await
            .unwrap();
        batcher.flush("B1", "T1", OperationKind::Create).await.unwrap();
        assert_eq!(submitter.calls.lock().await[0].3.priority, Some(7));
    }

    #[tokio::test]
    async fn second_flush_is_noop() {
        let (batcher, _store, submitter) = setup(10, 60_000, InvalidBatchPolicy::Drop);
        batcher.enqueue(&create_op(1)).await.unwrap();
        batcher.enqueue(&create_op(2)).await.unwrap();

        let first = batcher.flush("B1", "T1", OperationKind::Create).await.unwrap();
        let second = batcher.flush("B1", "T1", OperationKind::Create).await.unwrap();
        assert_eq!(first.map(|f| f.size), Some(2));
        assert!(second.is_none());
        assert_eq!(submitter.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn mixed_batch_is_dropped() {
        let (batcher, store, submitter) = setup(10, 60_000, InvalidBatchPolicy::Drop);
        let key = "batch:B1:T1:create";
        let stray = Operation::create("B2", "T1", Map::new());
        for op in [create_op(1), stray] {
            store
                .push_back(key, serde_json::to_string(&op).unwrap(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let err = batcher
            .flush("B1", "T1", OperationKind::Create)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidComposition(_)));
        assert!(submitter.calls.lock().await.is_empty());
        assert_eq!(store.len(key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mixed_batch_can_be_requeued() {
        let (batcher, store, submitter) = setup(10, 60_000, InvalidBatchPolicy::Requeue);
        let key = "batch:B1:T1:create";
        for op in [create_op(1), Operation::delete("B1", "T1", "rec1")] {
            store
                .push_back(key, serde_json::to_string(&op).unwrap(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert!(batcher.flush("B1", "T1", OperationKind::Create).await.is_err());
        assert!(submitter.calls.lock().await.is_empty());
        assert_eq!(store.len(key).await.unwrap(), 2);
        assert_eq!(batcher.pending_flushes(), 1);
    }

    #[tokio::test]
    async fn size_flush_reports_mixed_batch() {
        let (batcher, store, submitter) = setup(2, 60_000, InvalidBatchPolicy::Drop);
        let stray = Operation::create("B2", "T1", Map::new());
        store
            .push_back(
                "batch:B1:T1:create",
                serde_json::to_string(&stray).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = batcher.enqueue(&create_op(1)).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidComposition(_)));
        assert!(submitter.calls.lock().await.is_empty());
        assert_eq!(batcher.pending_flushes(), 0);
    }

    /// Memory store whose first `pop_front` fails.
    struct FlakyStore {
        inner: MemoryStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl CoordinationStore for FlakyStore {
        async fn take_token(
            &self,
            key: &str,
            params: &BucketParams,
            now_ms: i64,
        ) -> Result<TokenGrant, StoreError> {
            self.inner.take_token(key, params, now_ms).await
        }

        async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
            self.inner.hash_get(key, field).await
        }

        async fn push_back(
            &self,
            key: &str,
            value: String,
            ttl: Duration,
        ) -> Result<usize, StoreError> {
            self.inner.push_back(key, value, ttl).await
        }

        async fn push_front(
            &self,
            key: &str,
            values: Vec<String>,
            ttl: Duration,
        ) -> Result<usize, StoreError> {
            self.inner.push_front(key, values, ttl).await
        }

        async fn pop_front(&self, key: &str, max: usize) -> Result<Vec<String>, StoreError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.pop_front(key, max).await
        }

        async fn len(&self, key: &str) -> Result<usize, StoreError> {
            self.inner.len(key).await
        }

        async fn front(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.front(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn failed_timed_flush_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failed: AtomicBool::new(false),
        });
        let submitter = Arc::new(RecordingSubmitter::default());
        let batcher = Batcher::new(
            store.clone(),
            submitter.clone(),
            BatchSettings {
                flush_interval: Duration::from_millis(50),
                ..BatchSettings::default()
            },
        );
        batcher.enqueue(&create_op(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(submitter.calls.lock().await.len(), 1);
        assert_eq!(store.len("batch:B1:T1:create").await.unwrap(), 0);
        assert_eq!(batcher.pending_flushes(), 0);
    }

    #[tokio::test]
    async fn failed_submission_returns_operations() {
        let store = Arc::new(MemoryStore::new());
        let submitter = Arc::new(RecordingSubmitter {
            fail: true,
            ..Default::default()
        });
        let batcher = Batcher::new(store.clone(), submitter, BatchSettings::default());
        batcher.enqueue(&create_op(1)).await.unwrap();
        let err = batcher
            .flush("B1", "T1", OperationKind::Create)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Submit(_)));
        assert_eq!(store.len("batch:B1:T1:create").await.unwrap(), 1);
        batcher.destroy();
    }

    #[tokio::test]
    async fn status_reports_oldest_and_wait() {
        let (batcher, _store, _submitter) = setup(10, 1000, InvalidBatchPolicy::Drop);
        let empty = batcher
            .batch_status("B1", "T1", OperationKind::Create)
            .await
            .unwrap();
        assert_eq!(empty.size, 0);
        assert_eq!(empty.oldest_operation_timestamp, None);
        assert_eq!(empty.estimated_wait_ms, 0);

        let first = create_op(1);
        batcher.enqueue(&first).await.unwrap();
        batcher.enqueue(&create_op(2)).await.unwrap();
        let status = batcher
            .batch_status("B1", "T1", OperationKind::Create)
            .await
            .unwrap();
        assert_eq!(status.size, 2);
        assert_eq!(status.oldest_operation_timestamp, Some(first.timestamp));
        assert_eq!(status.estimated_wait_ms, 1000);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["estimatedWaitTime"], 1000);
        assert_eq!(json["oldestOperationTimestamp"], first.timestamp);
        batcher.destroy();
    }

    #[tokio::test]
    async fn destroy_cancels_timers() {
        let (batcher, store, submitter) = setup(10, 50, InvalidBatchPolicy::Drop);
        batcher.enqueue(&create_op(1)).await.unwrap();
        batcher.destroy();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(submitter.calls.lock().await.is_empty());
        assert_eq!(store.len("batch:B1:T1:create").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_many_checks_size_and_key() {
        let (batcher, _store, _submitter) = setup(10, 60_000, InvalidBatchPolicy::Drop);
        assert!(matches!(
            batcher.enqueue_many(Vec::new()).await,
            Err(BatchError::InvalidSize { got: 0, .. })
        ));
        let mixed = vec![create_op(1), Operation::delete("B1", "T1", "rec1")];
        assert!(matches!(
            batcher.enqueue_many(mixed).await,
            Err(BatchError::InvalidComposition(_))
        ));

        let res = batcher
            .enqueue_many(vec![create_op(1), create_op(2)])
            .await
            .unwrap();
        assert_eq!(res.operations.len(), 2);
        assert_eq!(res.queue_position, 2);
        assert_eq!(res.estimated_wait_ms, 60_000);
        batcher.destroy();
    }
}
