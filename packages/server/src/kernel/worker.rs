//! Bounded-concurrency pool that runs claimed jobs through the bisect
//! executor and publishes their output to the stream bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bisect::{run_bisect, BisectRequest};
use crate::clone_url::CloneUrlProvider;
use crate::kernel::job::{Job, JobStatus};
use crate::kernel::job_store::{JobOutcome, JobStore};
use crate::stream_bus::{StreamBus, StreamMessage};

pub struct WorkerPoolConfig {
    pub max_concurrent: usize,
    pub worker_id: String,
    pub stream_grace: Duration,
    pub bisect_timeout: Option<Duration>,
    pub max_attempts: i32,
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    stream_bus: StreamBus,
    clone_urls: Arc<dyn CloneUrlProvider>,
    config: WorkerPoolConfig,
    running: Arc<RwLock<HashMap<i64, CancellationToken>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        stream_bus: StreamBus,
        clone_urls: Arc<dyn CloneUrlProvider>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            stream_bus,
            clone_urls,
            config,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn running_count(&self) -> Arc<RwLock<HashMap<i64, CancellationToken>>> {
        self.running.clone()
    }

    /// Publishes the terminal `cancelled` status and closes out the stream
    /// for a job cancelled through the HTTP endpoint, independent of whether
    /// its run task is still unwinding from the cancellation token.
    pub async fn publish_cancelled(&self, job_id: i64) {
        self.stream_bus
            .publish(job_id, StreamMessage::status(JobStatus::Cancelled.as_str()))
            .await;
        self.stream_bus.mark_complete(job_id).await;
        self.schedule_cleanup(job_id);
    }

    pub fn available_capacity(&self, running_len: usize) -> usize {
        self.config.max_concurrent.saturating_sub(running_len)
    }

    /// Hand a freshly claimed batch of jobs to the pool. Each job runs as an
    /// independent task; this call returns once all of them have been
    /// dispatched, not once they've completed.
    pub async fn dispatch(self: &Arc<Self>, jobs: Vec<Job>, shutdown: &CancellationToken) {
        for job in jobs {
            let pool = self.clone();
            let job_cancel = shutdown.child_token();
            self.running.write().await.insert(job.id, job_cancel.clone());

            tokio::spawn(async move {
                pool.run_one(job, job_cancel).await;
            });
        }
    }

    async fn run_one(&self, job: Job, cancel: CancellationToken) {
        let job_id = job.id;

        self.stream_bus
            .publish(job_id, StreamMessage::status(JobStatus::Running.as_str()))
            .await;

        let clone_url = match self
            .clone_urls
            .clone_url_for(&job.repo_owner, &job.repo_name, job.installation_ref)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                let retriable = e.is_retriable();
                warn!(job_id, error = %e, retriable, "failed to resolve clone url");
                if retriable && job.attempt_count < self.config.max_attempts {
                    self.requeue_job(job_id).await;
                } else {
                    self.fail_job(job_id, format!("clone url: {e}"), None).await;
                }
                self.running.write().await.remove(&job_id);
                return;
            }
        };

        let request = BisectRequest {
            clone_url,
            good_sha: job.good_sha.clone(),
            bad_sha: job.bad_sha.clone(),
            test_command: job.test_command.clone(),
        };

        let sink = {
            let bus = self.stream_bus.clone();
            move |line: &str| {
                let bus = bus.clone();
                let job_id = job_id;
                let line = line.to_string();
                tokio::spawn(async move {
                    bus.publish(job_id, StreamMessage::log(line)).await;
                });
            }
        };

        let bisect_future = run_bisect(&request, &sink, &cancel);

        let outcome = match self.config.bisect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, bisect_future).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    self.timeout_job(job_id).await;
                    self.running.write().await.remove(&job_id);
                    return;
                }
            },
            None => bisect_future.await,
        };

        match outcome {
            Ok(result) if result.success => {
                debug!(job_id, culprit = ?result.culprit_sha, "bisect succeeded");
                let applied = self
                    .persist_outcome(
                        job_id,
                        JobOutcome::Success {
                            culprit_sha: result.culprit_sha,
                            culprit_message: result.culprit_message,
                            output_log: result.output_log,
                        },
                    )
                    .await;
                if applied {
                    self.stream_bus
                        .publish(job_id, StreamMessage::status(JobStatus::Success.as_str()))
                        .await;
                }
            }
            Ok(result) => {
                let message = result.error.unwrap_or_else(|| "bisect failed".to_string());
                self.fail_job(job_id, message, Some(result.output_log)).await;
            }
            Err(e) => {
                error!(job_id, error = %e, "bisect executor error");
                self.fail_job(job_id, e.to_string(), None).await;
            }
        }

        self.stream_bus.mark_complete(job_id).await;
        self.schedule_cleanup(job_id);
        self.running.write().await.remove(&job_id);
    }

    /// Writes a terminal outcome, guarded against a job that already moved
    /// to a terminal status out from under this task (e.g. it was cancelled
    /// while the bisect was still running). Returns whether the write
    /// applied, so callers only publish a status that actually took effect.
    async fn persist_outcome(&self, job_id: i64, outcome: JobOutcome) -> bool {
        match self.store.complete(job_id, outcome).await {
            Ok(applied) => applied,
            Err(e) => {
                error!(job_id, error = %e, "failed to persist job outcome");
                false
            }
        }
    }

    async fn fail_job(&self, job_id: i64, message: String, output_log: Option<String>) {
        let applied = self
            .persist_outcome(
                job_id,
                JobOutcome::Failed {
                    error_message: message,
                    output_log,
                },
            )
            .await;
        if applied {
            self.stream_bus
                .publish(job_id, StreamMessage::status(JobStatus::Failed.as_str()))
                .await;
        }
    }

    async fn timeout_job(&self, job_id: i64) {
        let applied = self
            .persist_outcome(job_id, JobOutcome::Timeout { output_log: None })
            .await;
        if applied {
            self.stream_bus
                .publish(job_id, StreamMessage::status(JobStatus::Timeout.as_str()))
                .await;
        }
        self.stream_bus.mark_complete(job_id).await;
        self.schedule_cleanup(job_id);
    }

    /// Resets a job to pending after a transient, retriable failure that
    /// isn't the job's fault, so `claim_next` can hand it to any worker
    /// again without burning an extra attempt.
    async fn requeue_job(&self, job_id: i64) {
        match self.store.requeue(job_id).await {
            Ok(true) => {
                self.stream_bus
                    .publish(job_id, StreamMessage::status(JobStatus::Pending.as_str()))
                    .await;
                self.stream_bus.mark_complete(job_id).await;
                self.schedule_cleanup(job_id);
            }
            Ok(false) => {
                debug!(job_id, "skipped requeue; job already left running state");
            }
            Err(e) => {
                error!(job_id, error = %e, "failed to requeue job after transient failure");
            }
        }
    }

    fn schedule_cleanup(&self, job_id: i64) {
        let bus = self.stream_bus.clone();
        let grace = self.config.stream_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            bus.cleanup(job_id).await;
        });
    }

    /// Cancel every job this pool instance is running and wait briefly for
    /// them to unwind, then reset any that are still marked running back to
    /// pending so another instance can recover them.
    pub async fn shutdown(&self, wait: Duration) {
        let ids: Vec<i64> = {
            let running = self.running.read().await;
            for token in running.values() {
                token.cancel();
            }
            running.keys().copied().collect()
        };

        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "waiting for running jobs to unwind");
        let start = std::time::Instant::now();
        while !self.running.read().await.is_empty() && start.elapsed() < wait {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if self.running.read().await.is_empty() {
            return;
        }

        match self.store.reset_worker_jobs(&self.config.worker_id).await {
            Ok(reset) => {
                for job in &reset {
                    warn!(job_id = job.id, "reset job still running at shutdown");
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    worker_id = %self.config.worker_id,
                    "failed to reset still-running jobs at shutdown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn available_capacity_is_bounded_by_max_concurrent() {
        let pool = WorkerPool::new(
            Arc::new(crate::kernel::job_store::PostgresJobStore::new(
                sqlx::PgPool::connect_lazy("postgres://localhost/does_not_matter").unwrap(),
            )),
            StreamBus::new(),
            Arc::new(crate::clone_url::StaticCloneUrlProvider::default()),
            WorkerPoolConfig {
                max_concurrent: 4,
                worker_id: "worker-test".to_string(),
                stream_grace: Duration::from_secs(1),
                bisect_timeout: None,
                max_attempts: 3,
            },
        );

        assert_eq!(pool.available_capacity(0), 4);
        assert_eq!(pool.available_capacity(3), 1);
        assert_eq!(pool.available_capacity(10), 0);
    }
}
