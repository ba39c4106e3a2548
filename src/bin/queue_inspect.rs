use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use record_relay::admission::RateLimiter;
use record_relay::config;
use record_relay::db;
use record_relay::queue::QueueManager;
use record_relay::store;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show one job instead of queue totals
    #[arg(long)]
    job: Option<String>,

    /// Show the trailing-minute metrics of a base
    #[arg(long)]
    base: Option<String>,

    /// Return jobs stuck in processing for this many seconds to pending
    #[arg(long)]
    requeue_stale_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url.clone());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let queue = QueueManager::new(pool.clone(), cfg.queue_settings());

    if let Some(secs) = args.requeue_stale_secs {
        let moved = queue.requeue_stale(Duration::from_secs(secs)).await?;
        println!("Requeued {} stale job(s)", moved);
    }

    if let Some(id) = args.job.as_deref() {
        let job = queue
            .job_status(id)
            .await?
            .ok_or_else(|| anyhow!("job {} not found", id))?;
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    if let Some(base_id) = args.base.as_deref() {
        let store = store::open(&cfg.coordination).await?;
        let limiter = RateLimiter::new(store, pool.clone(), cfg.admission_settings());
        let metrics = limiter.metrics(base_id).await;
        println!("Base: {}", base_id);
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        println!("Recent jobs:");
        for job in db::list_jobs_for_base(&pool, base_id, 20).await? {
            println!(
                "  {} {:<18} {:<10} attempts={}/{}",
                job.id,
                job.job_type.as_str(),
                job.status.as_str(),
                job.attempts,
                job.max_attempts
            );
        }
        return Ok(());
    }

    let counts = queue.queue_stats().await?;
    println!("Queue:");
    println!("  pending:    {} ({} delayed)", counts.pending, counts.delayed);
    println!("  processing: {}", counts.processing);
    println!("  completed:  {}", counts.completed);
    println!("  failed:     {}", counts.failed);
    Ok(())
}
