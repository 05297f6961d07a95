//! PostgreSQL-backed implementation of [`PersistenceLayer`].

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{JobFilter, PersistenceLayer, StatusUpdate};
use crate::domain::{
    job::DEFAULT_MAX_RETRIES, Job, JobDescriptor, JobHistoryEntry, JobStatus, RawScreenshot,
    Screenshot, SystemMetricSample,
};

const JOB_COLUMNS: &str = "id, external_job_id, provider, action, parameters, priority, \
     retry_count, max_retries, scheduled_for, status, assigned_worker, lock_id, locked_at, \
     created_at, updated_at, started_at, completed_at, result, evidence";

pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn append_history(
        &self,
        job_id: i64,
        status: &str,
        details: Option<String>,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO job_history (job_id, status, details) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(status)
            .bind(details.map(crate::domain::history::truncate_details))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Extract `result.screenshot_data` (if present), persist it, and
    /// return the result with that key stripped (spec.md §4.1).
    async fn extract_and_save_screenshots(
        &self,
        job_id: i64,
        result: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let mut result = result;
        let shots = result
            .as_object_mut()
            .and_then(|obj| obj.remove("screenshot_data"));

        if let Some(serde_json::Value::Array(items)) = shots {
            let raw: Vec<RawScreenshot> = items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect();
            if let Err(e) = self.save_screenshots(job_id, raw).await {
                tracing::warn!(job_id, error = %e, "failed to persist screenshots (best-effort)");
            }
        }

        Ok(result)
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, sqlx::Error> {
    Job::from_row(row)
}

use sqlx::FromRow;

#[async_trait]
impl PersistenceLayer for PgPersistence {
    async fn create_job(&self, descriptor: JobDescriptor) -> anyhow::Result<Job> {
        let max_retries = descriptor.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let row = sqlx::query(&format!(
            "INSERT INTO job_queue (external_job_id, provider, action, parameters, priority, \
             max_retries, scheduled_for) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {JOB_COLUMNS}"
        ))
        .bind(&descriptor.external_job_id)
        .bind(descriptor.provider)
        .bind(descriptor.action)
        .bind(&descriptor.parameters)
        .bind(descriptor.priority)
        .bind(max_retries)
        .bind(descriptor.scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        let job = row_to_job(&row)?;
        self.append_history(job.id, "pending", Some("job created".into()))
            .await?;
        Ok(job)
    }

    async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_job).transpose()?)
    }

    async fn list_jobs(&self, filter: JobFilter) -> anyhow::Result<Vec<Job>> {
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let rows = if let Some(status) = filter.status {
            sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM job_queue WHERE status = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
            ))
            .bind(status)
            .bind(limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM job_queue ORDER BY created_at DESC LIMIT $1 OFFSET $2"
            ))
            .bind(limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(row_to_job).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn get_pending_jobs(&self, limit: i64) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue \
             WHERE lock_id IS NULL AND ( \
                 status = 'pending' \
                 OR (status = 'retry_pending' AND (scheduled_for IS NULL OR scheduled_for <= now())) \
             ) \
             ORDER BY priority DESC, created_at ASC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn acquire_lock(&self, job_id: i64, lock_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE job_queue SET lock_id = $2, locked_at = now() \
             WHERE id = $1 AND lock_id IS NULL AND status IN ('pending', 'retry_pending')",
        )
        .bind(job_id)
        .bind(lock_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(
        &self,
        job_id: i64,
        lock_id: Uuid,
        new_status: JobStatus,
    ) -> anyhow::Result<bool> {
        let terminal = new_status.is_terminal();
        let result = sqlx::query(
            "UPDATE job_queue SET lock_id = NULL, locked_at = NULL, status = $3, \
             updated_at = now(), completed_at = CASE WHEN $4 THEN now() ELSE completed_at END \
             WHERE id = $1 AND lock_id = $2",
        )
        .bind(job_id)
        .bind(lock_id)
        .bind(new_status)
        .bind(terminal)
        .execute(&self.pool)
        .await?;

        let ok = result.rows_affected() > 0;
        if ok {
            self.append_history(job_id, new_status.as_str(), None).await?;
        }
        Ok(ok)
    }

    async fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        update: StatusUpdate,
        history_details: Option<String>,
    ) -> anyhow::Result<()> {
        let result_value = match update.result {
            Some(r) => Some(self.extract_and_save_screenshots(job_id, r).await?),
            None => None,
        };

        let terminal = status.is_terminal();
        let is_running = matches!(status, JobStatus::Running);

        sqlx::query(
            "UPDATE job_queue SET \
                status = $2, \
                result = COALESCE($3, result), \
                evidence = COALESCE($4, evidence), \
                assigned_worker = COALESCE($5, assigned_worker), \
                retry_count = COALESCE($8, retry_count), \
                scheduled_for = COALESCE($9, scheduled_for), \
                updated_at = now(), \
                started_at = CASE WHEN $6 AND started_at IS NULL THEN now() ELSE started_at END, \
                completed_at = CASE WHEN $7 AND completed_at IS NULL THEN now() ELSE completed_at END \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(status)
        .bind(&result_value)
        .bind(&update.evidence)
        .bind(&update.assigned_worker)
        .bind(is_running)
        .bind(terminal)
        .bind(update.retry_count)
        .bind(update.scheduled_for)
        .execute(&self.pool)
        .await?;

        self.append_history(job_id, status.as_str(), history_details)
            .await?;
        Ok(())
    }

    async fn recover_stale_locks(&self, max_age: Duration) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::from_std(max_age)?;

        let rows = sqlx::query(
            "SELECT id, status, retry_count, max_retries FROM job_queue \
             WHERE lock_id IS NOT NULL AND locked_at < $1 \
             AND status IN ('dispatching', 'running', 'retry_pending')",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0usize;
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let status: JobStatus = row.try_get("status")?;
            let retry_count: i32 = row.try_get("retry_count")?;
            let max_retries: i32 = row.try_get("max_retries")?;

            let new_status = if matches!(status, JobStatus::Running) && retry_count < max_retries
            {
                JobStatus::RetryPending
            } else {
                JobStatus::Pending
            };

            let bump_retry = matches!(new_status, JobStatus::RetryPending);

            sqlx::query(
                "UPDATE job_queue SET lock_id = NULL, locked_at = NULL, status = $2, \
                 retry_count = retry_count + CASE WHEN $3 THEN 1 ELSE 0 END, \
                 updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(new_status)
            .bind(bump_retry)
            .execute(&self.pool)
            .await?;

            self.append_history(id, "recovered", Some("stale lease reclaimed".into()))
                .await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn save_screenshots(
        &self,
        job_id: i64,
        screenshots: Vec<RawScreenshot>,
    ) -> anyhow::Result<usize> {
        let mut saved = 0usize;
        for shot in screenshots {
            let (Some(name), Some(data)) = (shot.name, shot.base64_data) else {
                continue;
            };
            let result = sqlx::query(
                "INSERT INTO job_screenshots (job_id, name, mime_type, description, image_data) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (job_id, name) DO NOTHING",
            )
            .bind(job_id)
            .bind(&name)
            .bind(&shot.mime_type)
            .bind(&shot.description)
            .bind(&data)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                saved += 1;
            }
        }
        Ok(saved)
    }

    async fn get_screenshots(&self, job_id: i64) -> anyhow::Result<Vec<Screenshot>> {
        let shots = sqlx::query_as::<_, Screenshot>(
            "SELECT job_id, name, mime_type, description, timestamp, image_data \
             FROM job_screenshots WHERE job_id = $1 ORDER BY timestamp ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(shots)
    }

    async fn get_history(&self, job_id: i64) -> anyhow::Result<Vec<JobHistoryEntry>> {
        let rows = sqlx::query_as::<_, JobHistoryEntry>(
            "SELECT job_id, status, timestamp, details FROM job_history \
             WHERE job_id = $1 ORDER BY timestamp ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn cancel_job(&self, job_id: i64) -> anyhow::Result<bool> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(false);
        };
        if !job.status.is_cancellable() {
            return Ok(false);
        }

        let marker = serde_json::json!({ "cancelled": true, "cancelled_at": Utc::now() });

        sqlx::query(
            "UPDATE job_queue SET status = 'cancelled', lock_id = NULL, locked_at = NULL, \
             result = $2, completed_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .bind(&marker)
        .execute(&self.pool)
        .await?;

        self.append_history(job_id, "cancelled", Some("cancelled via API".into()))
            .await?;
        Ok(true)
    }

    async fn save_metric_sample(&self, sample: SystemMetricSample) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO system_metrics (timestamp, queued, running, completed, failed, worker_status) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(sample.timestamp)
        .bind(sample.queued)
        .bind(sample.running)
        .bind(sample.completed)
        .bind(sample.failed)
        .bind(serde_json::to_value(&sample.worker_status)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_metric_samples(&self, limit: i64) -> anyhow::Result<Vec<SystemMetricSample>> {
        let rows = sqlx::query(
            "SELECT timestamp, queued, running, completed, failed, worker_status \
             FROM system_metrics ORDER BY timestamp DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let worker_status: serde_json::Value = row.try_get("worker_status")?;
                Ok(SystemMetricSample {
                    timestamp: row.try_get("timestamp")?,
                    queued: row.try_get("queued")?,
                    running: row.try_get("running")?,
                    completed: row.try_get("completed")?,
                    failed: row.try_get("failed")?,
                    worker_status: serde_json::from_value(worker_status).unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    async fn cleanup_evidence(
        &self,
        retention: ChronoDuration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let cutoff = now - retention;
        let result = sqlx::query(
            "DELETE FROM job_screenshots WHERE job_id IN ( \
                SELECT id FROM job_queue WHERE completed_at IS NOT NULL AND completed_at < $1 \
             )",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
