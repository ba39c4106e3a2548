//! Entry point for callers: validates a request, runs admission and hands the
//! resulting operations to the batcher.

use crate::admission::{RateLimitMetrics, RateLimiter};
use crate::batcher::{BatchError, BatchResult, BatchStatus, Batcher, FlushedBatch};
use crate::db::{self, Pool};
use crate::model::{Operation, OperationKind};
use crate::upstream::{QueryOptions, RecordUpdate};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};

/// Items accepted by one submit call.
pub const MAX_ITEMS_PER_CALL: usize = 10;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded for base {base_id}, retry after {retry_after_secs}s")]
    RateLimited {
        base_id: String,
        retry_after_secs: u64,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("base {0} not found or inactive")]
    BaseUnavailable(String),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("base lookup failed: {0:#}")]
    Database(#[from] anyhow::Error),
}

pub struct RecordGateway {
    pool: Pool,
    limiter: RateLimiter,
    batcher: Arc<Batcher>,
}

impl RecordGateway {
    pub fn new(pool: Pool, limiter: RateLimiter, batcher: Arc<Batcher>) -> Self {
        Self {
            pool,
            limiter,
            batcher,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn admit(&self, base_id: &str, count: usize) -> Result<(), GatewayError> {
        if count == 0 || count > MAX_ITEMS_PER_CALL {
            return Err(GatewayError::InvalidRequest(format!(
                "expected 1 to {} items, got {}",
                MAX_ITEMS_PER_CALL, count
            )));
        }
        match db::get_base(&self.pool, base_id).await? {
            Some(base) if base.is_active => {}
            _ => return Err(GatewayError::BaseUnavailable(base_id.to_string())),
        }
        if !self.limiter.acquire(base_id).await {
            let retry_after_secs = self.limiter.retry_after().as_secs();
            warn!(base_id, retry_after_secs, "request denied by rate limiter");
            return Err(GatewayError::RateLimited {
                base_id: base_id.to_string(),
                retry_after_secs,
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn submit_creates(
        &self,
        base_id: &str,
        resource_id: &str,
        items: Vec<Map<String, Value>>,
    ) -> Result<BatchResult, GatewayError> {
        self.admit(base_id, items.len()).await?;
        let ops = items
            .into_iter()
            .map(|fields| Operation::create(base_id, resource_id, fields))
            .collect();
        Ok(self.batcher.enqueue_many(ops).await?)
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn submit_updates(
        &self,
        base_id: &str,
        resource_id: &str,
        items: Vec<RecordUpdate>,
    ) -> Result<BatchResult, GatewayError> {
        if let Some(bad) = items.iter().find(|u| u.id.trim().is_empty()) {
            return Err(GatewayError::InvalidRequest(format!(
                "update without record id: {:?}",
                bad.fields
            )));
        }
        self.admit(base_id, items.len()).await?;
        let ops = items
            .into_iter()
            .map(|u| Operation::update(base_id, resource_id, &u.id, u.fields))
            .collect();
        Ok(self.batcher.enqueue_many(ops).await?)
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn submit_deletes(
        &self,
        base_id: &str,
        resource_id: &str,
        record_ids: Vec<String>,
    ) -> Result<BatchResult, GatewayError> {
        if record_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(GatewayError::InvalidRequest("empty record id".into()));
        }
        self.admit(base_id, record_ids.len()).await?;
        let ops = record_ids
            .iter()
            .map(|id| Operation::delete(base_id, resource_id, id))
            .collect();
        Ok(self.batcher.enqueue_many(ops).await?)
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn submit_query(
        &self,
        base_id: &str,
        resource_id: &str,
        options: QueryOptions,
    ) -> Result<BatchResult, GatewayError> {
        self.admit(base_id, 1).await?;
        let data = serde_json::to_value(&options).map_err(BatchError::Codec)?;
        let op = Operation::new(OperationKind::Query, base_id, resource_id).with_data(data);
        Ok(self.batcher.enqueue_many(vec![op]).await?)
    }

    pub async fn flush_batch(
        &self,
        base_id: &str,
        resource_id: &str,
        kind: OperationKind,
    ) -> Result<Option<FlushedBatch>, GatewayError> {
        Ok(self.batcher.flush(base_id, resource_id, kind).await?)
    }

    pub async fn batch_status(
        &self,
        base_id: &str,
        resource_id: &str,
        kind: OperationKind,
    ) -> Result<BatchStatus, GatewayError> {
        Ok(self.batcher.batch_status(base_id, resource_id, kind).await?)
    }

    pub async fn metrics(&self, base_id: &str) -> RateLimitMetrics {
        self.limiter.metrics(base_id).await
    }
}
