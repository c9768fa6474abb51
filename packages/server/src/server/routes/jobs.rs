//! Job submission, lookup, cancellation, and retry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::kernel::job::{Job, JobRequest, JobStatus};
use crate::server::app::AppState;
use crate::server::middleware::AuthenticatedUser;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub owner: String,
    pub repo: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    pub installation_ref: i64,
    pub runner_image_tag: Option<String>,
}

#[derive(Serialize)]
pub struct JobView {
    pub id: i64,
    pub status: JobStatus,
    pub repo_owner: String,
    pub repo_name: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    pub attempt_count: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub culprit_sha: Option<String>,
    pub culprit_message: Option<String>,
    pub error_message: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            repo_owner: job.repo_owner,
            repo_name: job.repo_name,
            good_sha: job.good_sha,
            bad_sha: job.bad_sha,
            test_command: job.test_command,
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            culprit_sha: job.culprit_sha,
            culprit_message: job.culprit_message,
            error_message: job.error_message,
        }
    }
}

fn validation_error(field: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("{field} is required") })),
    )
}

/// `POST /jobs` — validates required fields, inserts a pending job, and
/// wakes the pickup loop so it doesn't wait out its poll interval.
pub async fn submit_job(
    State(state): State<AppState>,
    user: Option<Extension<AuthenticatedUser>>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if body.owner.trim().is_empty() {
        return Err(validation_error("owner"));
    }
    if body.repo.trim().is_empty() {
        return Err(validation_error("repo"));
    }
    if body.good_sha.trim().is_empty() {
        return Err(validation_error("good_sha"));
    }
    if body.bad_sha.trim().is_empty() {
        return Err(validation_error("bad_sha"));
    }
    if body.test_command.trim().is_empty() {
        return Err(validation_error("test_command"));
    }

    let request = JobRequest {
        owner: body.owner,
        repo: body.repo,
        good_sha: body.good_sha,
        bad_sha: body.bad_sha,
        test_command: body.test_command,
        installation_ref: body.installation_ref,
        runner_image_tag: body.runner_image_tag,
        requested_by: user.map(|Extension(u)| u.subject),
    };

    let job = state.instance.store.insert(request).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("failed to create job: {e}") })),
        )
    })?;

    state.instance.wake_pickup_loop();

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": job.id,
            "status": job.status,
            "message": "job queued",
        })),
    ))
}

/// `GET /jobs/{id}` — current state of a bisect run.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<JobView>, StatusCode> {
    let job = state
        .instance
        .store
        .find_by_id(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(job.into()))
}

/// `POST /jobs/{id}/cancel` — rejects with 400 if the job already reached a
/// terminal status.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    user: Option<Extension<AuthenticatedUser>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let actor = user
        .map(|Extension(u)| u.subject)
        .unwrap_or_else(|| "anonymous".to_string());

    let previous = state
        .instance
        .store
        .cancel(id, &actor)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("cancel failed: {e}") })),
            )
        })?
        .ok_or((StatusCode::NOT_FOUND, Json(json!({ "error": "job not found" }))))?;

    if previous.is_terminal() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("job already {}", previous.as_str()),
            })),
        ));
    }

    let token = state
        .instance
        .worker_pool
        .running_count()
        .read()
        .await
        .get(&id)
        .cloned();

    if let Some(token) = token {
        token.cancel();
    }

    // Publish the terminal status here rather than relying on the run task
    // to notice the cancellation and do it: a pending job has no run task at
    // all, and a running job's task may take a moment to unwind.
    state.instance.worker_pool.publish_cancelled(id).await;

    Ok(Json(json!({ "id": id, "status": "cancelled" })))
}

/// `POST /jobs/{id}/retry` — only valid for jobs that ended failed or
/// cancelled; submits a fresh job cloning the original request.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let original = state
        .instance
        .store
        .find_by_id(id)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("lookup failed: {e}") })),
            )
        })?
        .ok_or((StatusCode::NOT_FOUND, Json(json!({ "error": "job not found" }))))?;

    if !original.is_retriable() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("job in status {} cannot be retried", original.status.as_str()),
            })),
        ));
    }

    let request = JobRequest {
        owner: original.repo_owner,
        repo: original.repo_name,
        good_sha: original.good_sha,
        bad_sha: original.bad_sha,
        test_command: original.test_command,
        installation_ref: original.installation_ref,
        runner_image_tag: original.runner_image_tag,
        requested_by: original.requested_by,
    };

    let job = state.instance.store.insert(request).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("failed to create retry job: {e}") })),
        )
    })?;

    state.instance.wake_pickup_loop();

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": job.id,
            "status": job.status,
            "retried_from": id,
        })),
    ))
}
