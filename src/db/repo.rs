use super::model::{BaseRecord, JobCounts, NewJob};
use crate::model::{from_ms, ApiCallMetric, BackoffKind, Job, JobStatus, JobType};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

const JOB_COLUMNS: &str = "id, base_id, job_type, status, priority, data, result, attempts, \
     max_attempts, backoff_kind, backoff_ms, error_message, scheduled_at, started_at, \
     completed_at, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus FULL sync: job transitions must survive a crash.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_base(pool: &Pool, base: &BaseRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO bases (base_id, name, api_key, rate_limit_rpm, is_active) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(base_id) DO UPDATE SET name = excluded.name, api_key = excluded.api_key, \
         rate_limit_rpm = excluded.rate_limit_rpm, is_active = excluded.is_active",
    )
    .bind(&base.base_id)
    .bind(&base.name)
    .bind(&base.api_key)
    .bind(base.rate_limit_rpm)
    .bind(base.is_active)
    .execute(pool)
    .await
    .context("failed to upsert base")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_base(pool: &Pool, base_id: &str) -> Result<Option<BaseRecord>> {
    let row = sqlx::query(
        "SELECT base_id, name, api_key, rate_limit_rpm, is_active FROM bases WHERE base_id = ?",
    )
    .bind(base_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| BaseRecord {
        base_id: row.get("base_id"),
        name: row.get("name"),
        api_key: row.get("api_key"),
        rate_limit_rpm: row.get("rate_limit_rpm"),
        is_active: row.get("is_active"),
    }))
}

#[instrument(skip_all)]
pub async fn insert_job(pool: &Pool, job: &NewJob, now_ms: i64) -> Result<Job> {
    let sql = format!(
        "INSERT INTO jobs (id, base_id, job_type, status, priority, data, attempts, max_attempts, \
         backoff_kind, backoff_ms, scheduled_at, created_at, updated_at) \
         VALUES (?, ?, ?, 'pending', ?, ?, 0, ?, ?, ?, ?, ?, ?) RETURNING {}",
        JOB_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(&job.id)
        .bind(&job.base_id)
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(serde_json::to_string(&job.data)?)
        .bind(job.max_attempts)
        .bind(job.backoff_kind.as_str())
        .bind(job.backoff_ms)
        .bind(job.scheduled_at_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(pool)
        .await
        .context("failed to insert job")?;
    job_from_row(&row)
}

/// Atomically move the most urgent due job of `job_type` from `pending` to
/// `processing`, counting the attempt. A single statement, so concurrent
/// workers (in this or another process) never claim the same job.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool, job_type: JobType, now_ms: i64) -> Result<Option<Job>> {
    let sql = format!(
        "UPDATE jobs SET status = 'processing', attempts = attempts + 1, started_at = ?, updated_at = ? \
         WHERE id = (SELECT id FROM jobs WHERE job_type = ? AND status = 'pending' AND scheduled_at <= ? \
                     ORDER BY priority DESC, scheduled_at ASC, created_at ASC LIMIT 1) \
         AND status = 'pending' RETURNING {}",
        JOB_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(now_ms)
        .bind(now_ms)
        .bind(job_type.as_str())
        .bind(now_ms)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn complete_job(pool: &Pool, id: &str, result: &Value, now_ms: i64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'completed', result = ?, error_message = NULL, completed_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(serde_json::to_string(result)?)
    .bind(now_ms)
    .bind(now_ms)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark job completed")?;
    Ok(())
}

/// Return a failed attempt to `pending`, due again at `retry_at_ms`.
#[instrument(skip_all)]
pub async fn retry_job(
    pool: &Pool,
    id: &str,
    error_message: &str,
    retry_at_ms: i64,
    now_ms: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'pending', error_message = ?, scheduled_at = ?, started_at = NULL, updated_at = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error_message)
    .bind(retry_at_ms)
    .bind(now_ms)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to schedule job retry")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fail_job(pool: &Pool, id: &str, error_message: &str, now_ms: i64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error_message)
    .bind(now_ms)
    .bind(now_ms)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark job failed")?;
    Ok(())
}

/// Return jobs stuck in `processing` since before `started_before_ms` to
/// `pending`. Used after an instance died mid-job.
#[instrument(skip_all)]
pub async fn requeue_stale_jobs(pool: &Pool, started_before_ms: i64, now_ms: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'pending', started_at = NULL, scheduled_at = ?, updated_at = ? \
         WHERE status = 'processing' AND started_at < ?",
    )
    .bind(now_ms)
    .bind(now_ms)
    .bind(started_before_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn get_job(pool: &Pool, id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn list_jobs_for_base(pool: &Pool, base_id: &str, limit: i64) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {} FROM jobs WHERE base_id = ? ORDER BY created_at DESC LIMIT ?",
        JOB_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(base_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(job_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_jobs_by_status(pool: &Pool, now_ms: i64) -> Result<JobCounts> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n, SUM(CASE WHEN scheduled_at > ? THEN 1 ELSE 0 END) AS future \
         FROM jobs GROUP BY status",
    )
    .bind(now_ms)
    .fetch_all(pool)
    .await?;

    let mut counts = JobCounts::default();
    for row in rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        match JobStatus::parse(&status) {
            Some(JobStatus::Pending) => {
                counts.pending = n;
                counts.delayed = row.try_get::<Option<i64>, _>("future")?.unwrap_or(0);
            }
            Some(JobStatus::Processing) => counts.processing = n,
            Some(JobStatus::Completed) => counts.completed = n,
            Some(JobStatus::Failed) => counts.failed = n,
            None => return Err(anyhow!("unknown job status {}", status)),
        }
    }
    Ok(counts)
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let backoff_kind: String = row.get("backoff_kind");
    let data: String = row.get("data");
    let result: Option<String> = row.get("result");

    Ok(Job {
        job_type: JobType::parse(&job_type)
            .ok_or_else(|| anyhow!("job {} has unknown type {}", id, job_type))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| anyhow!("job {} has unknown status {}", id, status))?,
        backoff_kind: BackoffKind::parse(&backoff_kind)
            .ok_or_else(|| anyhow!("job {} has unknown backoff {}", id, backoff_kind))?,
        data: serde_json::from_str(&data)
            .with_context(|| format!("job {} has malformed data", id))?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        base_id: row.get("base_id"),
        priority: row.get("priority"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        backoff_ms: row.get("backoff_ms"),
        error_message: row.get("error_message"),
        scheduled_at: from_ms(row.get("scheduled_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(from_ms),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_ms),
        created_at: from_ms(row.get("created_at")),
        id,
    })
}

#[instrument(skip_all)]
pub async fn insert_api_metric(pool: &Pool, metric: &ApiCallMetric) -> Result<()> {
    sqlx::query(
        "INSERT INTO api_metrics (base_id, endpoint, method, status_code, response_time_ms, timestamp) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&metric.base_id)
    .bind(&metric.endpoint)
    .bind(&metric.method)
    .bind(metric.status_code as i64)
    .bind(metric.response_time_ms)
    .bind(metric.timestamp.timestamp_millis())
    .execute(pool)
    .await
    .context("failed to record api metric")?;
    Ok(())
}

pub async fn recent_api_metrics(
    pool: &Pool,
    base_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<ApiCallMetric>> {
    let rows = sqlx::query(
        "SELECT base_id, endpoint, method, status_code, response_time_ms, timestamp \
         FROM api_metrics WHERE base_id = ? AND timestamp >= ? ORDER BY timestamp ASC",
    )
    .bind(base_id)
    .bind(since.timestamp_millis())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ApiCallMetric {
            base_id: row.get("base_id"),
            endpoint: row.get("endpoint"),
            method: row.get("method"),
            status_code: row.get::<i64, _>("status_code") as u16,
            response_time_ms: row.get("response_time_ms"),
            timestamp: from_ms(row.get("timestamp")),
        })
        .collect())
}
