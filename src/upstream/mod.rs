//! Upstream record API access: per-base client cache, retry with exponential
//! backoff, terminal-error classification and one metric row per call.

use crate::db::{self, BaseRecord, Pool};
use crate::model::ApiCallMetric;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub mod http;
pub mod model;

pub use http::HttpConnector;
pub use model::{NewRecord, QueryOptions, Record, RecordUpdate, SortDirection, SortSpec};

/// Error types the upstream reports for requests that can never succeed.
pub const TERMINAL_ERROR_TYPES: [&str; 9] = [
    "AUTHENTICATION_REQUIRED",
    "INVALID_API_KEY",
    "INVALID_BASE_ID",
    "INVALID_TABLE_ID",
    "INVALID_RECORD_ID",
    "INVALID_FIELD_NAME",
    "INVALID_FILTER_FORMULA",
    "INVALID_SORT_OBJECT",
    "INVALID_VIEW_ID",
];

/// A single failed attempt as reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiFailure {
    /// HTTP status when the upstream answered at all.
    pub status: Option<u16>,
    /// Upstream error type, e.g. `INVALID_API_KEY`.
    pub code: Option<String>,
    pub message: String,
}

impl ApiFailure {
    pub fn new(status: Option<u16>, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// A failure with no HTTP answer (connect error, timeout).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, None, message)
    }

    fn mentions(&self, needle: &str) -> bool {
        self.code.as_deref().is_some_and(|c| c.contains(needle)) || self.message.contains(needle)
    }
}

/// Whether retrying `failure` is pointless.
pub fn is_terminal(failure: &ApiFailure) -> bool {
    TERMINAL_ERROR_TYPES.iter().any(|t| failure.mentions(t))
        || matches!(failure.status, Some(401 | 403 | 404 | 422))
}

/// Explicit status when present, otherwise inferred from the error type.
pub fn status_code(failure: &ApiFailure) -> u16 {
    if let Some(status) = failure.status {
        return status;
    }
    if failure.mentions("AUTHENTICATION_REQUIRED") || failure.mentions("INVALID_API_KEY") {
        401
    } else if failure.mentions("INVALID_BASE_ID") || failure.mentions("INVALID_TABLE_ID") {
        404
    } else if failure.mentions("RATE_LIMIT") {
        429
    } else {
        500
    }
}

#[async_trait]
pub trait RecordsApi: Send + Sync {
    async fn create(&self, resource_id: &str, records: &[NewRecord]) -> Result<Vec<Record>, ApiFailure>;

    async fn update(
        &self,
        resource_id: &str,
        records: &[RecordUpdate],
    ) -> Result<Vec<Record>, ApiFailure>;

    async fn delete(&self, resource_id: &str, record_ids: &[String]) -> Result<Vec<Record>, ApiFailure>;

    async fn query(&self, resource_id: &str, options: &QueryOptions) -> Result<Vec<Record>, ApiFailure>;

    async fn get(&self, resource_id: &str, record_id: &str) -> Result<Record, ApiFailure>;
}

/// Builds a base-scoped API handle from the stored base configuration.
pub trait ApiConnector: Send + Sync {
    fn connect(&self, base: &BaseRecord) -> Result<Arc<dyn RecordsApi>, ApiFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exp)
    }
}

/// Run `op` until it succeeds, fails terminally, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ApiFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(failure) if is_terminal(&failure) || attempt >= max_attempts => return Err(failure),
            Err(failure) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "retrying upstream call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub base_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl ErrorContext {
    fn new(base_id: &str, resource_id: &str) -> Self {
        Self {
            base_id: base_id.to_string(),
            resource_id: Some(resource_id.to_string()),
            ..Self::default()
        }
    }
}

/// Normalized failure of an upstream call after retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream {operation} failed ({status_code}): {message}")]
pub struct UpstreamError {
    pub status_code: u16,
    pub operation: &'static str,
    pub code: Option<String>,
    pub message: String,
    pub context: ErrorContext,
}

impl UpstreamError {
    fn from_failure(failure: ApiFailure, operation: &'static str, context: ErrorContext) -> Self {
        Self {
            status_code: status_code(&failure),
            operation,
            code: failure.code.clone(),
            message: failure.message.clone(),
            context,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !is_terminal(&ApiFailure {
            status: Some(self.status_code),
            code: self.code.clone(),
            message: self.message.clone(),
        })
    }
}

pub struct UpstreamClient {
    pool: Pool,
    connector: Arc<dyn ApiConnector>,
    clients: RwLock<HashMap<String, Arc<dyn RecordsApi>>>,
    retry: RetryPolicy,
}

impl fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    pub fn new(pool: Pool, connector: Arc<dyn ApiConnector>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            connector,
            clients: RwLock::new(HashMap::new()),
            retry,
        }
    }

    /// Drop every cached per-base handle, e.g. after credentials rotate.
    pub fn clear_cache(&self) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let count = clients.len();
        clients.clear();
        info!(count, "upstream client cache cleared");
    }

    async fn client_for(&self, base_id: &str) -> Result<Arc<dyn RecordsApi>, ApiFailure> {
        if let Some(api) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(base_id)
        {
            return Ok(api.clone());
        }

        let base = match db::get_base(&self.pool, base_id).await {
            Ok(Some(base)) => base,
            Ok(None) => {
                return Err(ApiFailure::new(
                    Some(404),
                    Some("BASE_NOT_FOUND"),
                    format!("Base not found: {}", base_id),
                ))
            }
            Err(err) => return Err(ApiFailure::transport(format!("base lookup failed: {:#}", err))),
        };
        let api = self.connector.connect(&base)?;
        debug!(base_id, "upstream client created");
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(base_id.to_string(), api.clone());
        Ok(api)
    }

    async fn call<T, F, Fut>(
        &self,
        endpoint: &'static str,
        operation: &'static str,
        context: ErrorContext,
        op: F,
    ) -> Result<T, UpstreamError>
    where
        F: Fn(Arc<dyn RecordsApi>) -> Fut,
        Fut: Future<Output = Result<T, ApiFailure>>,
    {
        let started = Instant::now();
        let outcome = match self.client_for(&context.base_id).await {
            Ok(api) => with_retry(&self.retry, || op(api.clone())).await,
            Err(failure) => Err(failure),
        };
        let elapsed = started.elapsed().as_millis() as i64;
        let status = match &outcome {
            Ok(_) => 200,
            Err(failure) => status_code(failure),
        };
        self.record_call(&context.base_id, endpoint, status, elapsed)
            .await;

        outcome.map_err(|failure| {
            let err = UpstreamError::from_failure(failure, operation, context);
            error!(
                operation,
                status_code = err.status_code,
                context = ?err.context,
                error = %err.message,
                "upstream api error"
            );
            err
        })
    }

    async fn record_call(&self, base_id: &str, endpoint: &str, status_code: u16, elapsed_ms: i64) {
        let metric = ApiCallMetric {
            base_id: base_id.to_string(),
            endpoint: endpoint.to_string(),
            method: "POST".to_string(),
            status_code,
            response_time_ms: elapsed_ms,
            timestamp: Utc::now(),
        };
        if let Err(err) = db::insert_api_metric(&self.pool, &metric).await {
            error!(base_id, error = ?err, "failed to record api call");
        }
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn create_records(
        &self,
        base_id: &str,
        resource_id: &str,
        records: &[NewRecord],
    ) -> Result<Vec<Record>, UpstreamError> {
        let context = ErrorContext {
            record_count: Some(records.len()),
            ..ErrorContext::new(base_id, resource_id)
        };
        self.call("create", "createRecords", context, |api| async move {
            api.create(resource_id, records).await
        })
        .await
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn update_records(
        &self,
        base_id: &str,
        resource_id: &str,
        records: &[RecordUpdate],
    ) -> Result<Vec<Record>, UpstreamError> {
        let context = ErrorContext {
            record_count: Some(records.len()),
            ..ErrorContext::new(base_id, resource_id)
        };
        self.call("update", "updateRecords", context, |api| async move {
            api.update(resource_id, records).await
        })
        .await
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn delete_records(
        &self,
        base_id: &str,
        resource_id: &str,
        record_ids: &[String],
    ) -> Result<Vec<Record>, UpstreamError> {
        let context = ErrorContext {
            record_count: Some(record_ids.len()),
            ..ErrorContext::new(base_id, resource_id)
        };
        self.call("delete", "deleteRecords", context, |api| async move {
            api.delete(resource_id, record_ids).await
        })
        .await
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn query_records(
        &self,
        base_id: &str,
        resource_id: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Record>, UpstreamError> {
        let context = ErrorContext::new(base_id, resource_id);
        self.call("query", "queryRecords", context, |api| async move {
            api.query(resource_id, options).await
        })
        .await
    }

    #[instrument(skip_all, fields(base_id = %base_id, resource_id = %resource_id))]
    pub async fn get_record(
        &self,
        base_id: &str,
        resource_id: &str,
        record_id: &str,
    ) -> Result<Record, UpstreamError> {
        let context = ErrorContext {
            record_id: Some(record_id.to_string()),
            ..ErrorContext::new(base_id, resource_id)
        };
        self.call("get", "getRecord", context, |api| async move {
            api.get(resource_id, record_id).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn status_inference() {
        let f = |msg: &str| ApiFailure::transport(msg);
        assert_eq!(status_code(&f("INVALID_API_KEY: nope")), 401);
        assert_eq!(status_code(&f("AUTHENTICATION_REQUIRED")), 401);
        assert_eq!(status_code(&f("INVALID_TABLE_ID")), 404);
        assert_eq!(status_code(&f("RATE_LIMIT_REACHED")), 429);
        assert_eq!(status_code(&f("socket hang up")), 500);
        assert_eq!(status_code(&ApiFailure::new(Some(503), None, "x")), 503);
    }

    #[test]
    fn terminal_classification() {
        assert!(is_terminal(&ApiFailure::new(
            Some(422),
            Some("INVALID_FILTER_FORMULA"),
            "bad formula"
        )));
        assert!(is_terminal(&ApiFailure::transport("INVALID_VIEW_ID")));
        assert!(!is_terminal(&ApiFailure::new(Some(429), Some("RATE_LIMIT_REACHED"), "slow")));
        assert!(!is_terminal(&ApiFailure::new(Some(502), None, "bad gateway")));
    }

    #[test]
    fn delays_double() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn retry_stops_on_terminal_error() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let res: Result<(), _> = with_retry(&policy, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiFailure::transport("INVALID_API_KEY"))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_error() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let res = with_retry(&policy, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ApiFailure::new(Some(503), None, "unavailable"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn upstream_error_retryability() {
        let ctx = ErrorContext::new("B1", "T1");
        let auth = UpstreamError::from_failure(
            ApiFailure::transport("INVALID_API_KEY"),
            "createRecords",
            ctx.clone(),
        );
        assert_eq!(auth.status_code, 401);
        assert!(!auth.is_retryable());

        let flaky = UpstreamError::from_failure(ApiFailure::transport("timeout"), "createRecords", ctx);
        assert_eq!(flaky.status_code, 500);
        assert!(flaky.is_retryable());
    }
}
