//! Shared coordination store: token buckets, batch lists and deferred queues.
//!
//! Every method is one atomic step against the backing store. Callers never
//! read-modify-write across two calls, so instances sharing a store cannot
//! lose updates to each other.

use crate::config::{Coordination, StoreBackend};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const FIELD_TOKENS: &str = "tokens";
pub const FIELD_LAST_REFILL: &str = "lastRefill";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("malformed value under {key}: {value}")]
    Malformed { key: String, value: String },
}

/// Token bucket shape for one base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    pub capacity: i64,
    /// Tokens added per `window_ms`.
    pub refill_rate: i64,
    pub window_ms: i64,
    pub ttl: Duration,
}

impl BucketParams {
    /// Capacity and per-second refill derived from a requests-per-minute budget.
    pub fn from_rpm(rpm: i64, ttl: Duration) -> Self {
        let per_second = (rpm / 60).max(1);
        Self {
            capacity: per_second,
            refill_rate: per_second,
            window_ms: 1000,
            ttl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: i64,
    pub last_refill_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGrant {
    pub granted: bool,
    pub state: BucketState,
}

/// The token bucket step every backend evaluates atomically.
///
/// A missing bucket starts full. Whole tokens accrued since `last_refill_ms`
/// are added and the refill clock advances only by the time those tokens
/// represent, so callers arriving faster than one token interval still see
/// the bucket refill. A full bucket does not bank time.
pub fn step_bucket(current: Option<BucketState>, params: &BucketParams, now_ms: i64) -> TokenGrant {
    let capacity = params.capacity.max(0);
    let BucketState {
        tokens,
        mut last_refill_ms,
    } = current.unwrap_or(BucketState {
        tokens: capacity,
        last_refill_ms: now_ms,
    });
    let mut tokens = tokens.clamp(0, capacity);

    let elapsed = (now_ms - last_refill_ms).max(0);
    let added = if params.window_ms > 0 {
        elapsed.saturating_mul(params.refill_rate) / params.window_ms
    } else {
        capacity
    };

    if tokens.saturating_add(added) >= capacity {
        tokens = capacity;
        last_refill_ms = now_ms;
    } else if added > 0 {
        tokens += added;
        last_refill_ms += added * params.window_ms / params.refill_rate.max(1);
    }

    let granted = tokens >= 1;
    if granted {
        tokens -= 1;
    }
    TokenGrant {
        granted,
        state: BucketState {
            tokens,
            last_refill_ms,
        },
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Run the token bucket step on the hash under `key` and refresh its expiry.
    async fn take_token(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
    ) -> Result<TokenGrant, StoreError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Append to the tail, refresh expiry, return the new length.
    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> Result<usize, StoreError>;

    /// Re-insert values at the head, preserving their order.
    async fn push_front(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
    ) -> Result<usize, StoreError>;

    /// Remove and return up to `max` values from the head (oldest first).
    async fn pop_front(&self, key: &str, max: usize) -> Result<Vec<String>, StoreError>;

    async fn len(&self, key: &str) -> Result<usize, StoreError>;

    /// Oldest value without removing it.
    async fn front(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Open the store the `coordination` section selects.
pub async fn open(coordination: &Coordination) -> Result<Arc<dyn CoordinationStore>, StoreError> {
    match coordination.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = coordination
                .path
                .as_deref()
                .ok_or_else(|| StoreError::Unavailable("coordination.path is not set".into()))?;
            Ok(Arc::new(SqliteStore::open(path).await?))
        }
    }
}

pub fn rate_limit_key(base_id: &str) -> String {
    format!("rate_limit:{}", base_id)
}

pub fn deferred_queue_key(base_id: &str) -> String {
    format!("queue:{}", base_id)
}

pub(crate) fn parse_bucket(
    key: &str,
    tokens: Option<&str>,
    last_refill: Option<&str>,
) -> Result<Option<BucketState>, StoreError> {
    let (Some(tokens), Some(last_refill)) = (tokens, last_refill) else {
        return Ok(None);
    };
    let malformed = |value: &str| StoreError::Malformed {
        key: key.to_string(),
        value: value.to_string(),
    };
    Ok(Some(BucketState {
        tokens: tokens.parse().map_err(|_| malformed(tokens))?,
        last_refill_ms: last_refill.parse().map_err(|_| malformed(last_refill))?,
    }))
}
