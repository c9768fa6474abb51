//! Job model: a single git-bisect run, its request, its lease, and its outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A bisect run request plus its lease state and outcome.
///
/// `id` is a database-assigned serial, not a UUID: the dispatcher exposes
/// short, human-typeable job numbers in its HTTP API and SSE topics.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = 0)]
    pub id: i64,

    // Request
    pub installation_ref: i64,
    pub repo_owner: String,
    pub repo_name: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    #[builder(default, setter(strip_option))]
    pub runner_image_tag: Option<String>,
    #[builder(default, setter(strip_option))]
    pub requested_by: Option<String>,

    // State
    #[builder(default)]
    pub status: JobStatus,

    // Lease
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub attempt_count: i32,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    // Outcome
    #[builder(default, setter(strip_option))]
    pub culprit_sha: Option<String>,
    #[builder(default, setter(strip_option))]
    pub culprit_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub output_log: Option<String>,
}

/// Fields supplied by a submission request; everything else is derived.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub owner: String,
    pub repo: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    pub installation_ref: i64,
    pub runner_image_tag: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl Job {
    /// Whether this job can currently be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether this job can be retried (a fresh job submitted in its place).
    pub fn is_retriable(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .installation_ref(1i64)
            .repo_owner("octocat")
            .repo_name("hello-world")
            .good_sha("a".repeat(40))
            .bad_sha("b".repeat(40))
            .test_command("pytest -x")
            .build()
    }

    #[test]
    fn new_job_has_attempt_count_of_0() {
        assert_eq!(sample_job().attempt_count, 0);
    }

    #[test]
    fn new_job_starts_pending() {
        assert_eq!(sample_job().status, JobStatus::Pending);
    }

    #[test]
    fn pending_job_is_cancellable() {
        assert!(sample_job().is_cancellable());
    }

    #[test]
    fn success_job_is_not_cancellable() {
        let mut job = sample_job();
        job.status = JobStatus::Success;
        assert!(!job.is_cancellable());
    }

    #[test]
    fn failed_job_is_retriable() {
        let mut job = sample_job();
        job.status = JobStatus::Failed;
        assert!(job.is_retriable());
    }

    #[test]
    fn running_job_is_not_retriable() {
        let mut job = sample_job();
        job.status = JobStatus::Running;
        assert!(!job.is_retriable());
    }

    #[test]
    fn terminal_statuses_are_marked_terminal() {
        for status in [
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Timeout,
            JobStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
