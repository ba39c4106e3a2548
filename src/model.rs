use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Query,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Query => "query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            "query" => Some(OperationKind::Query),
            _ => None,
        }
    }

    /// Conventional dispatch priority; higher is more urgent.
    pub fn default_priority(&self) -> i32 {
        match self {
            OperationKind::Create => 1,
            OperationKind::Update => 2,
            OperationKind::Delete => 3,
            OperationKind::Query => 0,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single requested mutation or query against one resource of one base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub base_id: String,
    pub resource_id: String,
    /// Field map for create/update, query options for query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Target record for update/delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub priority: i32,
    /// Submission time, unix milliseconds.
    pub timestamp: i64,
}

impl Operation {
    pub fn new(kind: OperationKind, base_id: &str, resource_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            base_id: base_id.to_string(),
            resource_id: resource_id.to_string(),
            data: None,
            record_id: None,
            priority: kind.default_priority(),
            timestamp: now_ms(),
        }
    }

    pub fn create(base_id: &str, resource_id: &str, fields: Map<String, Value>) -> Self {
        Self::new(OperationKind::Create, base_id, resource_id).with_data(Value::Object(fields))
    }

    pub fn update(
        base_id: &str,
        resource_id: &str,
        record_id: &str,
        fields: Map<String, Value>,
    ) -> Self {
        Self::new(OperationKind::Update, base_id, resource_id)
            .with_record_id(record_id)
            .with_data(Value::Object(fields))
    }

    pub fn delete(base_id: &str, resource_id: &str, record_id: &str) -> Self {
        Self::new(OperationKind::Delete, base_id, resource_id).with_record_id(record_id)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_record_id(mut self, record_id: &str) -> Self {
        self.record_id = Some(record_id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn batch_key(&self) -> BatchKey {
        BatchKey::new(&self.base_id, &self.resource_id, self.kind)
    }
}

/// The (base, resource, kind) triple identifying one accumulation list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub base_id: String,
    pub resource_id: String,
    pub kind: OperationKind,
}

impl BatchKey {
    pub fn new(base_id: &str, resource_id: &str, kind: OperationKind) -> Self {
        Self {
            base_id: base_id.to_string(),
            resource_id: resource_id.to_string(),
            kind,
        }
    }

    pub fn matches(&self, op: &Operation) -> bool {
        op.base_id == self.base_id && op.resource_id == self.resource_id && op.kind == self.kind
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch:{}:{}:{}", self.base_id, self.resource_id, self.kind)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobType {
    #[serde(rename = "operation-dispatch")]
    OperationDispatch,
    #[serde(rename = "batch-dispatch")]
    BatchDispatch,
    #[serde(rename = "sync")]
    Sync,
    #[serde(rename = "webhook")]
    Webhook,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::OperationDispatch,
        JobType::BatchDispatch,
        JobType::Sync,
        JobType::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::OperationDispatch => "operation-dispatch",
            JobType::BatchDispatch => "batch-dispatch",
            JobType::Sync => "sync",
            JobType::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        JobType::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Exponential => "exponential",
            BackoffKind::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exponential" => Some(BackoffKind::Exponential),
            "fixed" => Some(BackoffKind::Fixed),
            _ => None,
        }
    }
}

/// Durable unit of work as persisted in the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub base_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i32,
    pub data: Value,
    pub result: Option<Value>,
    /// Attempts started so far; incremented when a worker claims the job.
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_kind: BackoffKind,
    pub backoff_ms: i64,
    pub error_message: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Delay before the next attempt after `self.attempts` attempts failed.
    pub fn retry_delay_ms(&self) -> i64 {
        match self.backoff_kind {
            BackoffKind::Fixed => self.backoff_ms,
            BackoffKind::Exponential => {
                let exp = (self.attempts - 1).clamp(0, 20) as u32;
                self.backoff_ms.saturating_mul(1_i64 << exp)
            }
        }
    }
}

/// One upstream call attempt (or admission check), never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiCallMetric {
    pub base_id: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub timestamp: DateTime<Utc>,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_key_encodes_triple() {
        let key = BatchKey::new("B1", "T1", OperationKind::Create);
        assert_eq!(key.to_string(), "batch:B1:T1:create");
    }

    #[test]
    fn conventional_priorities() {
        let fields = Map::new();
        assert_eq!(Operation::create("b", "t", fields.clone()).priority, 1);
        assert_eq!(Operation::update("b", "t", "rec1", fields).priority, 2);
        assert_eq!(Operation::delete("b", "t", "rec1").priority, 3);
    }

    #[test]
    fn operation_serializes_kind_lowercase() {
        let op = Operation::delete("b", "t", "rec1");
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["kind"], json!("delete"));
        assert_eq!(v["record_id"], json!("rec1"));
        assert!(v.get("data").is_none());
    }

    #[test]
    fn job_type_round_trips_through_str() {
        for t in JobType::ALL {
            assert_eq!(JobType::parse(t.as_str()), Some(t));
        }
        assert_eq!(JobType::parse("unknown"), None);
    }

    fn job_with(kind: BackoffKind, attempts: i32) -> Job {
        Job {
            id: "j".into(),
            base_id: "b".into(),
            job_type: JobType::Sync,
            status: JobStatus::Processing,
            priority: 0,
            data: json!({}),
            result: None,
            attempts,
            max_attempts: 5,
            backoff_kind: kind,
            backoff_ms: 2000,
            error_message: None,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        assert_eq!(job_with(BackoffKind::Exponential, 1).retry_delay_ms(), 2000);
        assert_eq!(job_with(BackoffKind::Exponential, 2).retry_delay_ms(), 4000);
        assert_eq!(job_with(BackoffKind::Exponential, 3).retry_delay_ms(), 8000);
        assert_eq!(job_with(BackoffKind::Fixed, 3).retry_delay_ms(), 2000);
    }
}
