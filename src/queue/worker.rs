use super::JobHandler;
use crate::db::{self, Pool};
use crate::model::{now_ms, Job, JobStatus, JobType};
use crate::upstream::UpstreamError;
use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, instrument, warn};

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    Failed { error: String, attempts: i32 },
}

impl JobOutcome {
    /// The outcome recorded on a persisted job, if it has one yet.
    pub fn from_job(job: &Job) -> Option<Self> {
        match job.status {
            JobStatus::Completed => Some(JobOutcome::Completed(
                job.result.clone().unwrap_or(Value::Null),
            )),
            JobStatus::Failed => Some(JobOutcome::Failed {
                error: job.error_message.clone().unwrap_or_default(),
                attempts: job.attempts,
            }),
            JobStatus::Pending | JobStatus::Processing => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub job_type: JobType,
    pub base_id: String,
    pub outcome: JobOutcome,
}

/// Upstream rejections that no amount of retrying will fix.
fn is_terminal_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<UpstreamError>()
            .is_some_and(|e| !e.is_retryable())
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Claim and run one due job of `job_type`. Returns `false` when nothing was
/// due. Every transition is written to the `jobs` table before it is
/// reported on `events`.
#[instrument(skip_all, fields(job_type = %job_type))]
pub async fn process_next_job(
    pool: &Pool,
    job_type: JobType,
    handler: &dyn JobHandler,
    events: &UnboundedSender<JobEvent>,
) -> Result<bool> {
    let Some(job) = db::claim_next_job(pool, job_type, now_ms()).await? else {
        return Ok(false);
    };

    // A panicking handler counts as a failed attempt so the claimed job is
    // not left in `processing`.
    let run = AssertUnwindSafe(handler.handle(&job))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(anyhow!("job handler panicked: {}", panic_message(payload)))
        });

    let outcome = match run {
        Ok(result) => {
            db::complete_job(pool, &job.id, &result, now_ms()).await?;
            info!(job_id = %job.id, base_id = %job.base_id, attempt = job.attempts, "job completed");
            JobOutcome::Completed(result)
        }
        Err(err) => {
            let message = format!("{:#}", err);
            let terminal = is_terminal_failure(&err);
            if terminal || job.attempts >= job.max_attempts {
                db::fail_job(pool, &job.id, &message, now_ms()).await?;
                error!(
                    job_id = %job.id,
                    base_id = %job.base_id,
                    attempt = job.attempts,
                    terminal,
                    error = %message,
                    "job failed"
                );
                JobOutcome::Failed {
                    error: message,
                    attempts: job.attempts,
                }
            } else {
                let delay = job.retry_delay_ms();
                let now = now_ms();
                db::retry_job(pool, &job.id, &message, now + delay, now).await?;
                warn!(
                    job_id = %job.id,
                    base_id = %job.base_id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_ms = delay,
                    error = %message,
                    "job attempt failed; backoff"
                );
                return Ok(true);
            }
        }
    };

    let _ = events.send(JobEvent {
        job_id: job.id,
        job_type,
        base_id: job.base_id,
        outcome,
    });
    Ok(true)
}
