//! Per-base admission control on a shared token bucket.

use crate::db::{self, Pool};
use crate::model::{from_ms, now_ms, ApiCallMetric};
use crate::store::{
    deferred_queue_key, rate_limit_key, BucketParams, CoordinationStore, StoreError,
    FIELD_LAST_REFILL,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const RATE_LIMIT_ENDPOINT: &str = "rate_limit_check";

/// What `acquire` answers when the coordination store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub default_rpm: u32,
    pub bucket_ttl: Duration,
    pub deferred_ttl: Duration,
    pub on_store_failure: FailurePolicy,
    pub retry_after: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            default_rpm: 300,
            bucket_ttl: Duration::from_secs(60),
            deferred_ttl: Duration::from_secs(3600),
            on_store_failure: FailurePolicy::Open,
            retry_after: Duration::from_secs(60),
        }
    }
}

/// Rolling one-minute view of a base's traffic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMetrics {
    pub requests_per_minute: usize,
    pub queue_depth: usize,
    pub average_response_time_ms: f64,
    pub error_rate: f64,
    pub last_reset_time: DateTime<Utc>,
}

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    pool: Pool,
    settings: AdmissionSettings,
    clock: Clock,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, pool: Pool, settings: AdmissionSettings) -> Self {
        Self {
            store,
            pool,
            settings,
            clock: Arc::new(now_ms),
        }
    }

    /// Replace the millisecond clock used for refill math and metric stamps.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    pub fn retry_after(&self) -> Duration {
        self.settings.retry_after
    }

    /// Take one token for `base_id`. `false` means the caller should back off
    /// for [`retry_after`](Self::retry_after).
    #[instrument(skip_all, fields(base_id = %base_id))]
    pub async fn acquire(&self, base_id: &str) -> bool {
        let params = self.bucket_params(base_id).await;
        let key = rate_limit_key(base_id);
        let granted = match self.store.take_token(&key, &params, (self.clock)()).await {
            Ok(grant) => {
                debug!(tokens = grant.state.tokens, granted = grant.granted, "token bucket step");
                grant.granted
            }
            Err(err) => {
                let allow = self.settings.on_store_failure == FailurePolicy::Open;
                error!(error = ?err, allow, "coordination store failure during admission");
                allow
            }
        };
        self.record_check(base_id, granted).await;
        granted
    }

    async fn bucket_params(&self, base_id: &str) -> BucketParams {
        let rpm = match db::get_base(&self.pool, base_id).await {
            Ok(Some(base)) if base.rate_limit_rpm > 0 => base.rate_limit_rpm,
            Ok(_) => self.settings.default_rpm as i64,
            Err(err) => {
                warn!(base_id, error = ?err, "base lookup failed; using default budget");
                self.settings.default_rpm as i64
            }
        };
        BucketParams::from_rpm(rpm, self.settings.bucket_ttl)
    }

    async fn record_check(&self, base_id: &str, granted: bool) {
        let metric = ApiCallMetric {
            base_id: base_id.to_string(),
            endpoint: RATE_LIMIT_ENDPOINT.to_string(),
            method: "GET".to_string(),
            status_code: if granted { 200 } else { 429 },
            response_time_ms: 0,
            timestamp: from_ms((self.clock)()),
        };
        if let Err(err) = db::insert_api_metric(&self.pool, &metric).await {
            warn!(base_id, error = ?err, "failed to record admission check");
        }
    }

    /// Number of deferred requests waiting for `base_id`.
    pub async fn queue_depth(&self, base_id: &str) -> usize {
        match self.store.len(&deferred_queue_key(base_id)).await {
            Ok(n) => n,
            Err(err) => {
                error!(base_id, error = ?err, "failed to read queue depth");
                0
            }
        }
    }

    /// Aggregate the trailing minute of recorded calls plus live queue depth.
    /// Degrades to zeros when either backend is unavailable.
    #[instrument(skip_all, fields(base_id = %base_id))]
    pub async fn metrics(&self, base_id: &str) -> RateLimitMetrics {
        let now = (self.clock)();
        let recent = match db::recent_api_metrics(&self.pool, base_id, from_ms(now - 60_000)).await
        {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = ?err, "failed to load recent metrics");
                return RateLimitMetrics::empty(from_ms(now));
            }
        };

        let total = recent.len();
        let (average_response_time_ms, error_rate) = if total > 0 {
            let latency: i64 = recent.iter().map(|m| m.response_time_ms).sum();
            let errors = recent.iter().filter(|m| m.status_code >= 400).count();
            (latency as f64 / total as f64, errors as f64 / total as f64)
        } else {
            (0.0, 0.0)
        };

        let last_reset_time = match self
            .store
            .hash_get(&rate_limit_key(base_id), FIELD_LAST_REFILL)
            .await
        {
            Ok(Some(v)) => v.parse().map(from_ms).unwrap_or_else(|_| from_ms(now)),
            Ok(None) => from_ms(now),
            Err(err) => {
                error!(error = ?err, "failed to read bucket state");
                return RateLimitMetrics::empty(from_ms(now));
            }
        };

        RateLimitMetrics {
            requests_per_minute: total,
            queue_depth: self.queue_depth(base_id).await,
            average_response_time_ms,
            error_rate,
            last_reset_time,
        }
    }

    /// Park a request that was denied admission. Objects are stamped with the
    /// deferral time unless they already carry one.
    pub async fn defer(&self, base_id: &str, mut request: Value) -> Result<usize, StoreError> {
        if let Value::Object(map) = &mut request {
            map.entry("timestamp")
                .or_insert_with(|| Value::from((self.clock)()));
        }
        let depth = self
            .store
            .push_back(
                &deferred_queue_key(base_id),
                request.to_string(),
                self.settings.deferred_ttl,
            )
            .await?;
        debug!(base_id, depth, "request deferred");
        Ok(depth)
    }

    /// Hand back the oldest deferred request once a token is available for it.
    pub async fn take_deferred(&self, base_id: &str) -> Result<Option<Value>, StoreError> {
        let key = deferred_queue_key(base_id);
        if self.store.len(&key).await? == 0 || !self.acquire(base_id).await {
            return Ok(None);
        }
        let Some(raw) = self.store.pop_front(&key, 1).await?.pop() else {
            return Ok(None);
        };
        let request: Value = serde_json::from_str(&raw).map_err(|_| StoreError::Malformed {
            key: key.clone(),
            value: raw.clone(),
        })?;
        info!(base_id, "processing deferred request");
        Ok(Some(request))
    }

    /// Manual override: forget the bucket so the next acquire starts full.
    pub async fn reset(&self, base_id: &str) -> Result<(), StoreError> {
        self.store.delete(&rate_limit_key(base_id)).await?;
        info!(base_id, "rate limit reset");
        Ok(())
    }
}

impl RateLimitMetrics {
    fn empty(at: DateTime<Utc>) -> Self {
        Self {
            requests_per_minute: 0,
            queue_depth: 0,
            average_response_time_ms: 0.0,
            error_rate: 0.0,
            last_reset_time: at,
        }
    }
}
