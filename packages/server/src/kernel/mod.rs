//! Core infrastructure: the job model, its durable store, and the worker
//! pool that executes claimed jobs.

pub mod job;
pub mod job_store;
pub mod worker;

pub use job::{Job, JobRequest, JobStatus};
pub use job_store::{JobOutcome, JobStore, PostgresJobStore};
pub use worker::{WorkerPool, WorkerPoolConfig};
