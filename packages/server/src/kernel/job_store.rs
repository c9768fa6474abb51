//! Durable job queue backed by Postgres.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so that multiple dispatcher
//! instances sharing one database never observe the same row as available.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::job::{Job, JobRequest, JobStatus};

const JOB_COLUMNS: &str = "id, installation_ref, repo_owner, repo_name, good_sha, bad_sha, \
    test_command, runner_image_tag, requested_by, status, worker_id, heartbeat_at, \
    attempt_count, created_at, started_at, completed_at, culprit_sha, culprit_message, \
    error_message, output_log";

/// Outcome persisted by [`JobStore::complete`].
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success {
        culprit_sha: Option<String>,
        culprit_message: Option<String>,
        output_log: String,
    },
    Failed {
        error_message: String,
        output_log: Option<String>,
    },
    Timeout {
        output_log: Option<String>,
    },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, request: JobRequest) -> anyhow::Result<Job>;
    async fn find_by_id(&self, id: i64) -> anyhow::Result<Option<Job>>;
    async fn claim_next(&self, worker_id: &str, limit: i64) -> anyhow::Result<Vec<Job>>;
    async fn heartbeat(&self, id: i64) -> anyhow::Result<()>;
    /// Persists a terminal outcome. Only applies if the job is still
    /// `running`; returns `false` without error if it already moved to a
    /// terminal status (e.g. it was cancelled concurrently), so a completion
    /// racing a cancellation never resurrects the row.
    async fn complete(&self, id: i64, outcome: JobOutcome) -> anyhow::Result<bool>;
    async fn claim_stale(
        &self,
        threshold_secs: i64,
        max_attempts: i32,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>>;
    async fn cancel(&self, id: i64, actor: &str) -> anyhow::Result<Option<JobStatus>>;
    /// Resets a single `running` job back to `pending` for re-claim, without
    /// incrementing its attempt count. Used after a transient, retriable
    /// failure that isn't the job's own fault (e.g. a clone-URL outage).
    async fn requeue(&self, id: i64) -> anyhow::Result<bool>;
    /// Resets every `running` job currently leased to `worker_id` back to
    /// `pending`, clearing its lease fields. Used when an instance shuts
    /// down with jobs still in flight.
    async fn reset_worker_jobs(&self, worker_id: &str) -> anyhow::Result<Vec<Job>>;
}

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, request: JobRequest) -> anyhow::Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (
                installation_ref, repo_owner, repo_name, good_sha, bad_sha,
                test_command, runner_image_tag, requested_by, status, attempt_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, NOW())
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(request.installation_ref)
        .bind(&request.owner)
        .bind(&request.repo)
        .bind(&request.good_sha)
        .bind(&request.bad_sha)
        .bind(&request.test_command)
        .bind(&request.runner_image_tag)
        .bind(&request.requested_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find_by_id(&self, id: i64) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Atomically claim up to `limit` pending jobs for `worker_id`.
    ///
    /// `SELECT ... FOR UPDATE SKIP LOCKED` inside the CTE lets N concurrent
    /// callers partition the same pending set without blocking each other;
    /// the enclosing `UPDATE ... RETURNING` performs the claim in one
    /// round trip so no other transaction can observe the rows as pending
    /// between the select and the update.
    async fn claim_next(&self, worker_id: &str, limit: i64) -> anyhow::Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id FROM jobs
                WHERE status = 'pending'
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $2,
                started_at = COALESCE(started_at, NOW()),
                heartbeat_at = NOW(),
                attempt_count = attempt_count + 1
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn heartbeat(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET heartbeat_at = NOW() WHERE id = $1 AND status = 'running'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn complete(&self, id: i64, outcome: JobOutcome) -> anyhow::Result<bool> {
        let result = match outcome {
            JobOutcome::Success {
                culprit_sha,
                culprit_message,
                output_log,
            } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'success',
                        culprit_sha = $1,
                        culprit_message = $2,
                        output_log = $3,
                        completed_at = NOW(),
                        worker_id = NULL,
                        heartbeat_at = NULL
                    WHERE id = $4 AND status = 'running'
                    "#,
                )
                .bind(culprit_sha)
                .bind(culprit_message)
                .bind(output_log)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            JobOutcome::Failed {
                error_message,
                output_log,
            } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        error_message = $1,
                        output_log = $2,
                        completed_at = NOW(),
                        worker_id = NULL,
                        heartbeat_at = NULL
                    WHERE id = $3 AND status = 'running'
                    "#,
                )
                .bind(error_message)
                .bind(output_log)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            JobOutcome::Timeout { output_log } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'timeout',
                        error_message = 'bisect exceeded the configured timeout',
                        output_log = $1,
                        completed_at = NOW(),
                        worker_id = NULL,
                        heartbeat_at = NULL
                    WHERE id = $2 AND status = 'running'
                    "#,
                )
                .bind(output_log)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() > 0)
    }

    async fn requeue(&self, id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                heartbeat_at = NULL,
                started_at = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_worker_jobs(&self, worker_id: &str) -> anyhow::Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                heartbeat_at = NULL,
                started_at = NULL
            WHERE worker_id = $1 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Reset jobs whose heartbeat has gone stale back to PENDING so they can
    /// be re-claimed, unless they have exhausted their attempt budget, in
    /// which case they are dead-ended as FAILED.
    async fn claim_stale(
        &self,
        threshold_secs: i64,
        max_attempts: i32,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        let exhausted = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH stale AS (
                SELECT id FROM jobs
                WHERE status = 'running'
                  AND heartbeat_at < NOW() - ($1 || ' seconds')::INTERVAL
                  AND attempt_count >= $2
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'failed',
                error_message = 'max attempts exceeded after worker lease expired',
                completed_at = NOW(),
                worker_id = NULL,
                heartbeat_at = NULL
            WHERE id IN (SELECT id FROM stale)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(threshold_secs)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let recovered = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH stale AS (
                SELECT id FROM jobs
                WHERE status = 'running'
                  AND heartbeat_at < NOW() - ($1 || ' seconds')::INTERVAL
                  AND attempt_count < $2
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                heartbeat_at = NULL,
                started_at = NULL
            WHERE id IN (SELECT id FROM stale)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(threshold_secs)
        .bind(max_attempts)
        .bind(limit - exhausted.len() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(recovered)
    }

    async fn cancel(&self, id: i64, actor: &str) -> anyhow::Result<Option<JobStatus>> {
        let row: Option<(JobStatus,)> =
            sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((previous,)) = row else {
            return Ok(None);
        };

        if previous.is_terminal() {
            return Ok(Some(previous));
        }

        // Guarded so a job that raced to a terminal status between the
        // SELECT above and this UPDATE (e.g. the worker finished it first)
        // is reported as already-terminal rather than clobbered.
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_message = $1,
                completed_at = NOW(),
                worker_id = NULL,
                heartbeat_at = NULL
            WHERE id = $2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(format!("job cancelled by {actor}"))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(Some(previous))
    }
}

/// Used by the heartbeat loop's unit tests without a live database.
pub fn heartbeat_due(heartbeat_at: Option<DateTime<Utc>>, threshold_secs: i64) -> bool {
    match heartbeat_at {
        None => true,
        Some(ts) => Utc::now().signed_duration_since(ts).num_seconds() >= threshold_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_due_when_never_beaten() {
        assert!(heartbeat_due(None, 60));
    }

    #[test]
    fn heartbeat_not_due_when_recent() {
        assert!(!heartbeat_due(Some(Utc::now()), 60));
    }

    #[test]
    fn heartbeat_due_when_stale() {
        let old = Utc::now() - chrono::Duration::seconds(120);
        assert!(heartbeat_due(Some(old), 60));
    }
}
