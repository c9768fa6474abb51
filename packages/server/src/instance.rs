//! Owns the process-wide state for one running copy of the dispatcher:
//! the stream bus, the running-jobs map (via the worker pool), the shutdown
//! signal, and the wake signal the submission endpoint uses to skip the
//! pickup loop's poll interval. Constructed once at startup; never a
//! process-wide global, so tests can build independent instances.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clone_url::CloneUrlProvider;
use crate::config::Config;
use crate::kernel::job_store::{JobStore, PostgresJobStore};
use crate::kernel::worker::{WorkerPool, WorkerPoolConfig};
use crate::stream_bus::StreamBus;

pub struct Instance {
    pub store: Arc<dyn JobStore>,
    pub worker_pool: Arc<WorkerPool>,
    pub stream_bus: StreamBus,
    pub shutdown: CancellationToken,
    pub wake: Arc<Notify>,
    pub worker_id: String,
    pub config: Config,
    pub db_pool: PgPool,
}

impl Instance {
    pub fn new(db_pool: PgPool, config: Config, clone_urls: Arc<dyn CloneUrlProvider>) -> Self {
        let worker_id = format!(
            "{}-{}-{}",
            hostname(),
            std::process::id(),
            chrono::Utc::now().timestamp()
        );

        let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(db_pool.clone()));
        let stream_bus = StreamBus::with_capacity(config.stream_buffer_size);

        let worker_pool = Arc::new(WorkerPool::new(
            store.clone(),
            stream_bus.clone(),
            clone_urls,
            WorkerPoolConfig {
                max_concurrent: config.max_concurrent_jobs,
                worker_id: worker_id.clone(),
                stream_grace: Duration::from_secs(config.stream_grace_seconds),
                bisect_timeout: config.bisect_timeout_s.map(Duration::from_secs),
                max_attempts: config.max_job_attempts,
            },
        ));

        Self {
            store,
            worker_pool,
            stream_bus,
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            worker_id,
            config,
            db_pool,
        }
    }

    /// Fired by the submission endpoint so the pickup loop claims the new
    /// job immediately instead of waiting out its poll interval. Coalesces
    /// naturally: `Notify::notify_one` is a no-op if a permit is already
    /// pending.
    pub fn wake_pickup_loop(&self) {
        self.wake.notify_one();
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.worker_pool.shutdown(Duration::from_secs(30)).await;
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "dispatcher".to_string())
}
