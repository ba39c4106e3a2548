use anyhow::Result;
use clap::Parser;
use record_relay::config;
use record_relay::db;
use record_relay::relay::Relay;
use record_relay::store;
use record_relay::upstream::HttpConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Seconds between queue statistics log lines (0 disables)
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url.clone());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = store::open(&cfg.coordination).await?;
    let connector = HttpConnector::new(
        &cfg.upstream.api_url,
        Duration::from_secs(cfg.upstream.timeout_seconds),
    )?;
    let relay = Relay::build(&cfg, pool, store, Arc::new(connector));
    relay.start().await?;

    if args.stats_interval > 0 {
        let stats_queue = relay.queue.clone();
        let every = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match stats_queue.queue_stats().await {
                    Ok(c) => info!(
                        pending = c.pending,
                        delayed = c.delayed,
                        processing = c.processing,
                        completed = c.completed,
                        failed = c.failed,
                        "queue stats"
                    ),
                    Err(err) => error!(?err, "failed to read queue stats"),
                }
            }
        });
    }

    info!("record relay running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    relay.shutdown().await;
    Ok(())
}
