//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{BackoffKind, JobType};
use serde::Serialize;
use serde_json::Value;

/// Base configuration row: credentials and request budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseRecord {
    pub base_id: String,
    pub name: String,
    pub api_key: String,
    pub rate_limit_rpm: i64,
    pub is_active: bool,
}

/// Insert parameters for a new pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub base_id: String,
    pub job_type: JobType,
    pub priority: i32,
    pub data: Value,
    pub max_attempts: i32,
    pub backoff_kind: BackoffKind,
    pub backoff_ms: i64,
    pub scheduled_at_ms: i64,
}

/// Job counts grouped by status. `delayed` is the subset of `pending`
/// whose scheduled time lies in the future.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}
