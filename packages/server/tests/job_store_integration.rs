//! Exercises the durable job queue against a real Postgres instance, backed
//! by a disposable container. Each test starts its own container so tests
//! can run concurrently without interfering with each other's claims.

use dispatcher_core::kernel::{JobOutcome, JobStore, PostgresJobStore};
use dispatcher_core::kernel::job::JobRequest;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

struct Db {
    pool: PgPool,
    _container: ContainerAsync<Postgres>,
}

async fn setup() -> Db {
    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start postgres container");

    let host = container.get_host().await.unwrap();
    let port = container.get_host_port_ipv4(5432).await.unwrap();
    let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&url)
        .await
        .expect("failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    Db {
        pool,
        _container: container,
    }
}

fn sample_request() -> JobRequest {
    JobRequest {
        owner: "octocat".to_string(),
        repo: "hello-world".to_string(),
        good_sha: "a".repeat(40),
        bad_sha: "b".repeat(40),
        test_command: "pytest -x".to_string(),
        installation_ref: 1,
        runner_image_tag: None,
        requested_by: None,
    }
}

#[tokio::test]
async fn inserted_job_is_claimable_exactly_once_across_concurrent_workers() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let job = store.insert(sample_request()).await.unwrap();

    let (a, b) = tokio::join!(
        store.claim_next("worker-a", 10),
        store.claim_next("worker-b", 10),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    let total_claimed: usize = a.len() + b.len();
    assert_eq!(total_claimed, 1, "job must be claimed by exactly one worker");

    let claimed_by_a = a.iter().any(|j| j.id == job.id);
    let claimed_by_b = b.iter().any(|j| j.id == job.id);
    assert!(claimed_by_a ^ claimed_by_b);
}

#[tokio::test]
async fn stale_running_job_under_attempt_budget_is_recovered_to_pending() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let job = store.insert(sample_request()).await.unwrap();
    store.claim_next("worker-a", 1).await.unwrap();

    sqlx::query("UPDATE jobs SET heartbeat_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(job.id)
        .execute(&db.pool)
        .await
        .unwrap();

    let recovered = store.claim_stale(300, 3, 10).await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, job.id);
    assert_eq!(recovered[0].status.as_str(), "pending");
}

#[tokio::test]
async fn stale_job_past_attempt_budget_is_dead_ended_as_failed() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let job = store.insert(sample_request()).await.unwrap();
    for _ in 0..3 {
        store.claim_next("worker-a", 1).await.unwrap();
        sqlx::query("UPDATE jobs SET heartbeat_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
            .bind(job.id)
            .execute(&db.pool)
            .await
            .unwrap();
        let _ = store.claim_stale(300, 3, 10).await.unwrap();
    }

    let final_job = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status.as_str(), "failed");
    assert_eq!(final_job.attempt_count, 3);
}

#[tokio::test]
async fn cancel_is_rejected_once_a_job_is_terminal() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let job = store.insert(sample_request()).await.unwrap();
    store
        .complete(
            job.id,
            JobOutcome::Success {
                culprit_sha: Some("c".repeat(40)),
                culprit_message: Some("fix the thing".to_string()),
                output_log: "ok".to_string(),
            },
        )
        .await
        .unwrap();

    let previous = store.cancel(job.id, "someone").await.unwrap().unwrap();
    assert_eq!(previous.as_str(), "success");

    let unchanged = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status.as_str(), "success");
}

#[tokio::test]
async fn complete_does_not_overwrite_a_job_already_cancelled() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let job = store.insert(sample_request()).await.unwrap();
    store.claim_next("worker-a", 1).await.unwrap();
    store.cancel(job.id, "someone").await.unwrap();

    let applied = store
        .complete(
            job.id,
            JobOutcome::Failed {
                error_message: "subprocess cancelled".to_string(),
                output_log: None,
            },
        )
        .await
        .unwrap();
    assert!(!applied, "completing an already-terminal job must be a no-op");

    let unchanged = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status.as_str(), "cancelled");
}

#[tokio::test]
async fn requeue_resets_a_running_job_without_touching_attempt_count() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let job = store.insert(sample_request()).await.unwrap();
    store.claim_next("worker-a", 1).await.unwrap();

    let applied = store.requeue(job.id).await.unwrap();
    assert!(applied);

    let reset = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(reset.status.as_str(), "pending");
    assert!(reset.worker_id.is_none());
    assert!(reset.heartbeat_at.is_none());
    assert_eq!(reset.attempt_count, 1);
}

#[tokio::test]
async fn requeue_is_a_no_op_once_the_job_already_completed() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let job = store.insert(sample_request()).await.unwrap();
    store.claim_next("worker-a", 1).await.unwrap();
    store
        .complete(job.id, JobOutcome::Timeout { output_log: None })
        .await
        .unwrap();

    let applied = store.requeue(job.id).await.unwrap();
    assert!(!applied);

    let unchanged = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status.as_str(), "timeout");
}

#[tokio::test]
async fn reset_worker_jobs_recovers_only_that_workers_running_jobs() {
    let db = setup().await;
    let store = PostgresJobStore::new(db.pool.clone());

    let owned = store.insert(sample_request()).await.unwrap();
    store.claim_next("worker-a", 10).await.unwrap();
    let other = store.insert(sample_request()).await.unwrap();
    store.claim_next("worker-b", 10).await.unwrap();

    let reset = store.reset_worker_jobs("worker-a").await.unwrap();
    assert_eq!(reset.len(), 1);
    assert_eq!(reset[0].id, owned.id);

    let owned_after = store.find_by_id(owned.id).await.unwrap().unwrap();
    assert_eq!(owned_after.status.as_str(), "pending");
    assert!(owned_after.worker_id.is_none());

    let other_after = store.find_by_id(other.id).await.unwrap().unwrap();
    assert_eq!(other_after.status.as_str(), "running");
}
