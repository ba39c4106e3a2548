//! Durable job queue backed by the `jobs` table, with a fixed worker pool per
//! job type and a supervisor that turns worker events into per-job outcomes.

use crate::db::{self, JobCounts, NewJob, Pool};
use crate::model::{now_ms, BackoffKind, Job, JobType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod handlers;
pub mod worker;

pub use worker::{process_next_job, JobEvent, JobOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Workers per registered job type.
    pub concurrency: usize,
    pub max_attempts: i32,
    /// Base delay of the default exponential backoff.
    pub backoff: Duration,
    /// Idle sleep between polls when no job is due.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Exponential(Duration),
    Fixed(Duration),
}

/// Per-submission overrides; unset fields fall back to [`QueueSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: Option<i32>,
    pub delay: Duration,
    pub max_attempts: Option<i32>,
    pub backoff: Option<Backoff>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0:#}")]
    Database(#[from] anyhow::Error),
    #[error("job payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("queue is closed")]
    Closed,
    #[error("job {0} not found")]
    NotFound(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<Value>;
}

/// The narrow surface producers need; lets the batcher stay independent of
/// the worker pool.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(
        &self,
        job_type: JobType,
        base_id: &str,
        data: Value,
        options: JobOptions,
    ) -> Result<Job, QueueError>;
}

type Waiters = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<JobOutcome>>>>>;

fn lock_waiters(waiters: &Waiters) -> MutexGuard<'_, HashMap<String, Vec<oneshot::Sender<JobOutcome>>>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop senders whose receiver is gone, and ids left without any.
fn prune_closed(waiters: &mut HashMap<String, Vec<oneshot::Sender<JobOutcome>>>) {
    waiters.retain(|_, slot| {
        slot.retain(|tx| !tx.is_closed());
        !slot.is_empty()
    });
}

pub struct QueueManager {
    pool: Pool,
    settings: QueueSettings,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    paused: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<JobEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<JobEvent>>>,
    waiters: Waiters,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("settings", &self.settings)
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    pub fn new(pool: Pool, settings: QueueSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            settings,
            handlers: HashMap::new(),
            paused: watch::channel(false).0,
            shutdown: watch::channel(false).0,
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            workers: tokio::sync::Mutex::new(Vec::new()),
            supervisor: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Register the handler that workers of `job_type` dispatch to.
    pub fn register(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Spawn the supervisor and `concurrency` workers per registered type.
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let Some(mut events_rx) = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        let Some(events_tx) = self
            .events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return Err(QueueError::Closed);
        };

        let waiters = self.waiters.clone();
        *self.supervisor.lock().await = Some(tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                supervise(&waiters, event);
            }
            debug!("queue supervisor stopped");
        }));

        let mut workers = self.workers.lock().await;
        for (&job_type, handler) in &self.handlers {
            for slot in 0..self.settings.concurrency {
                workers.push(tokio::spawn(run_worker(
                    self.pool.clone(),
                    job_type,
                    slot,
                    handler.clone(),
                    events_tx.clone(),
                    self.paused.subscribe(),
                    self.shutdown.subscribe(),
                    self.settings.poll_interval,
                )));
            }
        }
        info!(
            job_types = self.handlers.len(),
            concurrency = self.settings.concurrency,
            "queue workers started"
        );
        Ok(())
    }

    pub fn pause_all(&self) {
        self.paused.send_replace(true);
        info!("queue paused");
    }

    pub fn resume_all(&self) {
        self.paused.send_replace(false);
        info!("queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stop accepting jobs, let in-flight jobs finish, then stop every worker
    /// and the supervisor. Pending jobs stay in the table for the next start.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for res in futures::future::join_all(workers).await {
            if let Err(err) = res {
                warn!(error = ?err, "queue worker ended abnormally");
            }
        }

        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            let _ = supervisor.await;
        }
        // Whoever still waits gets `Closed`.
        lock_waiters(&self.waiters).clear();
        info!("queue closed");
    }

    pub async fn job_status(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(db::get_job(&self.pool, job_id).await?)
    }

    pub async fn queue_stats(&self) -> Result<JobCounts, QueueError> {
        Ok(db::count_jobs_by_status(&self.pool, now_ms()).await?)
    }

    /// Resolve once `job_id` reaches a terminal state.
    pub async fn wait_for(&self, job_id: &str) -> Result<JobOutcome, QueueError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock_waiters(&self.waiters);
            prune_closed(&mut waiters);
            waiters.entry(job_id.to_string()).or_default().push(tx);
        }

        // The job may already have finished before we registered.
        let answered = match db::get_job(&self.pool, job_id).await {
            Err(err) => Some(Err(QueueError::from(err))),
            Ok(None) => Some(Err(QueueError::NotFound(job_id.to_string()))),
            Ok(Some(job)) => match JobOutcome::from_job(&job) {
                Some(outcome) => Some(Ok(outcome)),
                None if self.closed.load(Ordering::SeqCst) => Some(Err(QueueError::Closed)),
                None => None,
            },
        };
        if let Some(res) = answered {
            drop(rx);
            prune_closed(&mut lock_waiters(&self.waiters));
            return res;
        }
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Callers currently blocked in `wait_for`.
    pub fn pending_waiters(&self) -> usize {
        lock_waiters(&self.waiters)
            .values()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Return jobs left in `processing` for longer than `older_than` (their
    /// worker died) to `pending`.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let now = now_ms();
        let moved =
            db::requeue_stale_jobs(&self.pool, now - older_than.as_millis() as i64, now).await?;
        if moved > 0 {
            warn!(moved, "stale jobs returned to pending");
        }
        Ok(moved)
    }
}

#[async_trait]
impl JobSubmitter for QueueManager {
    async fn submit(
        &self,
        job_type: JobType,
        base_id: &str,
        data: Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let (backoff_kind, backoff) = match options
            .backoff
            .unwrap_or(Backoff::Exponential(self.settings.backoff))
        {
            Backoff::Exponential(d) => (BackoffKind::Exponential, d),
            Backoff::Fixed(d) => (BackoffKind::Fixed, d),
        };
        let now = now_ms();
        let new_job = NewJob {
            id: Uuid::new_v4().to_string(),
            base_id: base_id.to_string(),
            job_type,
            priority: options.priority.unwrap_or(0),
            data,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.settings.max_attempts)
                .max(1),
            backoff_kind,
            backoff_ms: backoff.as_millis() as i64,
            scheduled_at_ms: now + options.delay.as_millis() as i64,
        };
        let job = db::insert_job(&self.pool, &new_job, now).await?;
        debug!(job_id = %job.id, job_type = %job_type, base_id, priority = job.priority, "job submitted");
        Ok(job)
    }
}

fn supervise(waiters: &Waiters, event: JobEvent) {
    match &event.outcome {
        JobOutcome::Completed(_) => debug!(job_id = %event.job_id, job_type = %event.job_type, "job finished"),
        JobOutcome::Failed { error, attempts } => error!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            base_id = %event.base_id,
            attempts,
            error = %error,
            "job failed permanently"
        ),
    }
    if let Some(senders) = lock_waiters(waiters).remove(&event.job_id) {
        for tx in senders {
            let _ = tx.send(event.outcome.clone());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    pool: Pool,
    job_type: JobType,
    slot: usize,
    handler: Arc<dyn JobHandler>,
    events: mpsc::UnboundedSender<JobEvent>,
    mut paused: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    debug!(job_type = %job_type, slot, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if *paused.borrow() {
            tokio::select! {
                res = paused.changed() => if res.is_err() { break },
                _ = shutdown.changed() => {}
            }
            continue;
        }

        let idle = match process_next_job(&pool, job_type, handler.as_ref(), &events).await {
            Ok(true) => None,
            Ok(false) => Some(poll_interval),
            Err(err) => {
                error!(job_type = %job_type, error = ?err, "queue worker error");
                Some(Duration::from_secs(1))
            }
        };
        if let Some(idle) = idle {
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                res = shutdown.changed() => if res.is_err() { break },
            }
        }
    }
    debug!(job_type = %job_type, slot, "worker stopped");
}
