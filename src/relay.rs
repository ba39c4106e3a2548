//! Wires the shared store, admission, batching, the job queue and the
//! upstream client into one running relay.

use crate::admission::RateLimiter;
use crate::batcher::Batcher;
use crate::config::Config;
use crate::db::Pool;
use crate::gateway::RecordGateway;
use crate::model::JobType;
use crate::queue::handlers::{
    BatchDispatchHandler, OperationDispatchHandler, SyncHandler, WebhookHandler,
};
use crate::queue::{QueueError, QueueManager};
use crate::store::CoordinationStore;
use crate::upstream::{ApiConnector, UpstreamClient};
use std::sync::Arc;
use tracing::info;

pub struct Relay {
    pub queue: Arc<QueueManager>,
    pub upstream: Arc<UpstreamClient>,
    pub batcher: Arc<Batcher>,
    pub gateway: RecordGateway,
}

impl Relay {
    /// Build every component from `cfg`. Nothing runs until `start`.
    pub fn build(
        cfg: &Config,
        pool: Pool,
        store: Arc<dyn CoordinationStore>,
        connector: Arc<dyn ApiConnector>,
    ) -> Self {
        let upstream = Arc::new(UpstreamClient::new(
            pool.clone(),
            connector,
            cfg.retry_policy(),
        ));
        let queue = Arc::new(
            QueueManager::new(pool.clone(), cfg.queue_settings())
                .register(
                    JobType::BatchDispatch,
                    Arc::new(BatchDispatchHandler::new(upstream.clone())),
                )
                .register(
                    JobType::OperationDispatch,
                    Arc::new(OperationDispatchHandler::new(upstream.clone())),
                )
                .register(JobType::Sync, Arc::new(SyncHandler::new(upstream.clone())))
                .register(JobType::Webhook, Arc::new(WebhookHandler::new(upstream.clone()))),
        );
        let limiter = RateLimiter::new(store.clone(), pool.clone(), cfg.admission_settings());
        let batcher = Batcher::new(store, queue.clone(), cfg.batch_settings());
        let gateway = RecordGateway::new(pool, limiter, batcher.clone());
        Self {
            queue,
            upstream,
            batcher,
            gateway,
        }
    }

    pub async fn start(&self) -> Result<(), QueueError> {
        self.queue.start().await?;
        info!("relay started");
        Ok(())
    }

    /// Stop flush timers first so no batch is submitted to a closing queue.
    /// Queued operations and pending jobs stay where they are.
    pub async fn shutdown(&self) {
        self.batcher.destroy();
        self.queue.close().await;
        info!("relay stopped");
    }
}
