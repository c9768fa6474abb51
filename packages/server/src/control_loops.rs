//! Three cooperative background loops shared by every dispatcher instance:
//! heartbeat, job pickup, and stale-job recovery.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::instance::Instance;

/// Renews the lease on every job this instance currently owns so the
/// recovery loop on any instance never mistakes live work for abandoned
/// work.
pub async fn heartbeat_loop(instance: Arc<Instance>) {
    let interval = Duration::from_secs(instance.config.heartbeat_interval_s);
    loop {
        tokio::select! {
            _ = instance.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let ids: Vec<i64> = instance
            .worker_pool
            .running_count()
            .read()
            .await
            .keys()
            .copied()
            .collect();

        for id in ids {
            if let Err(e) = instance.store.heartbeat(id).await {
                warn!(job_id = id, error = %e, "heartbeat failed");
            }
        }
    }
    debug!("heartbeat loop stopped");
}

/// Claims pending jobs in bursts up to remaining capacity, waiting on the
/// poll interval or the level-triggered wake signal, whichever comes first.
pub async fn pickup_loop(instance: Arc<Instance>) {
    let poll_interval = Duration::from_secs(instance.config.job_poll_interval_s);

    loop {
        if instance.shutdown.is_cancelled() {
            break;
        }

        let running_len = instance.worker_pool.running_count().read().await.len();
        let capacity = instance.worker_pool.available_capacity(running_len);

        if capacity > 0 {
            match instance.store.claim_next(&instance.worker_id, capacity as i64).await {
                Ok(jobs) if !jobs.is_empty() => {
                    debug!(count = jobs.len(), "claimed jobs");
                    instance.worker_pool.dispatch(jobs, &instance.shutdown).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
        }

        tokio::select! {
            _ = instance.shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
            _ = instance.wake.notified() => {}
        }
    }
    debug!("pickup loop stopped");
}

/// Periodically resets jobs whose heartbeat has gone stale, then wakes the
/// pickup loop so it claims them without waiting out the poll interval.
pub async fn recovery_loop(instance: Arc<Instance>) {
    let interval = Duration::from_secs(instance.config.recovery_scan_interval_s);

    loop {
        tokio::select! {
            _ = instance.shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match instance
            .store
            .claim_stale(
                instance.config.stale_job_threshold_s,
                instance.config.max_job_attempts,
                instance.config.max_concurrent_jobs as i64,
            )
            .await
        {
            Ok(recovered) if !recovered.is_empty() => {
                warn!(count = recovered.len(), "recovered stale jobs");
                instance.wake.notify_one();
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "stale job recovery failed"),
        }
    }
    debug!("recovery loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_threshold_exceeds_twice_heartbeat_interval() {
        // The recovery loop must never treat an instance's own actively
        // heartbeating job as stale.
        let heartbeat_interval_s = 60;
        let stale_job_threshold_s = 300;
        assert!(stale_job_threshold_s as u64 > 2 * heartbeat_interval_s);
    }
}
