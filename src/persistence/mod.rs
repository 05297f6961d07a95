//! Persistence Layer (spec.md §4.1, component A).
//!
//! `PersistenceLayer` is the seam between the Dispatcher/Scheduler/API and
//! durable storage, mirroring the teacher's `JobQueue` trait
//! (`kernel/jobs/queue.rs`). `PgPersistence` is the production
//! implementation; `MemoryPersistence` backs unit tests so the
//! dispatch/retry/standardize pipeline can be exercised without a live
//! database, mirroring the teacher's `TestJobManager`.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Job, JobDescriptor, JobHistoryEntry, JobStatus, RawScreenshot, Screenshot, SystemMetricSample};

pub use memory::MemoryPersistence;
pub use pg::PgPersistence;

/// Optional fields carried by a status-update write (spec.md §4.1
/// `update_job_status`).
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub result: Option<serde_json::Value>,
    pub evidence: Option<Vec<String>>,
    pub assigned_worker: Option<String>,
    /// Set by the Retry Controller when scheduling a retry attempt.
    pub retry_count: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    async fn create_job(&self, descriptor: JobDescriptor) -> anyhow::Result<Job>;

    async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>>;

    async fn list_jobs(&self, filter: JobFilter) -> anyhow::Result<Vec<Job>>;

    /// Jobs whose `status = pending` OR (`status = retry_pending` AND
    /// `scheduled_for <= now`), with no active lease, ordered by
    /// `priority DESC, created_at ASC`, limited to `limit`.
    async fn get_pending_jobs(&self, limit: i64) -> anyhow::Result<Vec<Job>>;

    /// Atomic conditional update: succeeds iff the row currently has
    /// `lock_id = NULL` and `status IN (pending, retry_pending)`.
    async fn acquire_lock(&self, job_id: i64, lock_id: Uuid) -> anyhow::Result<bool>;

    /// Atomic conditional update: succeeds iff `lock_id` matches the
    /// current lease holder. Clears the lease and sets `new_status`.
    async fn release_lock(
        &self,
        job_id: i64,
        lock_id: Uuid,
        new_status: JobStatus,
    ) -> anyhow::Result<bool>;

    /// Writes status/result/evidence/worker, appends a history row,
    /// stamps `started_at`/`completed_at` on first entry into running /
    /// terminal, and extracts embedded `screenshot_data` out of `result`.
    async fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        update: StatusUpdate,
        history_details: Option<String>,
    ) -> anyhow::Result<()>;

    /// For each stale-leased row, clears the lease and restores it to
    /// `pending` or `retry_pending` per spec.md §4.1.
    async fn recover_stale_locks(&self, max_age: std::time::Duration) -> anyhow::Result<usize>;

    async fn save_screenshots(
        &self,
        job_id: i64,
        screenshots: Vec<RawScreenshot>,
    ) -> anyhow::Result<usize>;

    async fn get_screenshots(&self, job_id: i64) -> anyhow::Result<Vec<Screenshot>>;

    async fn get_history(&self, job_id: i64) -> anyhow::Result<Vec<JobHistoryEntry>>;

    /// Cancel a job currently in a cancellable state. Returns `false` if
    /// the job does not exist or is not cancellable.
    async fn cancel_job(&self, job_id: i64) -> anyhow::Result<bool>;

    async fn save_metric_sample(&self, sample: SystemMetricSample) -> anyhow::Result<()>;

    async fn recent_metric_samples(&self, limit: i64) -> anyhow::Result<Vec<SystemMetricSample>>;

    /// Deletes evidence (screenshot rows) for jobs that completed more
    /// than `retention` ago, or whose owning job no longer exists.
    /// Returns the number of jobs whose evidence was purged.
    async fn cleanup_evidence(&self, retention: chrono::Duration, now: DateTime<Utc>) -> anyhow::Result<usize>;
}
