//! In-memory [`PersistenceLayer`] used by unit and integration tests,
//! mirroring the teacher's `TestJobManager`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobFilter, PersistenceLayer, StatusUpdate};
use crate::domain::{
    history::truncate_details, job::DEFAULT_MAX_RETRIES, Job, JobDescriptor, JobHistoryEntry,
    JobStatus, RawScreenshot, Screenshot, SystemMetricSample,
};

#[derive(Default)]
struct State {
    jobs: HashMap<i64, Job>,
    history: Vec<JobHistoryEntry>,
    screenshots: Vec<Screenshot>,
    metrics: Vec<SystemMetricSample>,
}

/// Thread-safe in-memory store. Good enough to exercise dispatch/retry
/// logic in tests; not a substitute for the Postgres locking semantics
/// under real concurrency.
pub struct MemoryPersistence {
    state: Mutex<State>,
    next_id: AtomicI64,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl PersistenceLayer for MemoryPersistence {
    async fn create_job(&self, descriptor: JobDescriptor) -> anyhow::Result<Job> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let job = Job {
            id,
            external_job_id: descriptor.external_job_id,
            provider: descriptor.provider,
            action: descriptor.action,
            parameters: descriptor.parameters,
            priority: descriptor.priority,
            retry_count: 0,
            max_retries: descriptor.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            scheduled_for: descriptor.scheduled_for,
            status: JobStatus::Pending,
            assigned_worker: None,
            lock_id: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            evidence: None,
        };

        let mut state = self.state.lock().await;
        state.jobs.insert(id, job.clone());
        state.history.push(JobHistoryEntry {
            job_id: id,
            status: "pending".to_string(),
            timestamp: now,
            details: Some("job created".to_string()),
        });
        Ok(job)
    }

    async fn get_job(&self, job_id: i64) -> anyhow::Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: JobFilter) -> anyhow::Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.status.map(|s| s == j.status).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        let limit = if filter.limit > 0 { filter.limit as usize } else { 50 };
        let offset = filter.offset.max(0) as usize;
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_pending_jobs(&self, limit: i64) -> anyhow::Result<Vec<Job>> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn acquire_lock(&self, job_id: i64, lock_id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.lock_id.is_some()
            || !matches!(job.status, JobStatus::Pending | JobStatus::RetryPending)
        {
            return Ok(false);
        }
        job.lock_id = Some(lock_id);
        job.locked_at = Some(Utc::now());
        Ok(true)
    }

    async fn release_lock(
        &self,
        job_id: i64,
        lock_id: Uuid,
        new_status: JobStatus,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.lock_id != Some(lock_id) {
            return Ok(false);
        }
        job.lock_id = None;
        job.locked_at = None;
        job.status = new_status;
        job.updated_at = Utc::now();
        if new_status.is_terminal() {
            job.completed_at.get_or_insert(Utc::now());
        }
        state.history.push(JobHistoryEntry {
            job_id,
            status: new_status.as_str().to_string(),
            timestamp: Utc::now(),
            details: None,
        });
        Ok(true)
    }

    async fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        update: StatusUpdate,
        history_details: Option<String>,
    ) -> anyhow::Result<()> {
        let mut result_value = update.result;
        let mut extracted_screenshots = Vec::new();
        if let Some(value) = result_value.as_mut() {
            if let Some(obj) = value.as_object_mut() {
                if let Some(serde_json::Value::Array(items)) = obj.remove("screenshot_data") {
                    extracted_screenshots = items
                        .into_iter()
                        .filter_map(|v| serde_json::from_value::<RawScreenshot>(v).ok())
                        .collect();
                }
            }
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = status;
            if let Some(r) = result_value {
                job.result = Some(r);
            }
            if let Some(e) = update.evidence {
                job.evidence = Some(e);
            }
            if let Some(w) = update.assigned_worker {
                job.assigned_worker = Some(w);
            }
            if let Some(rc) = update.retry_count {
                job.retry_count = rc;
            }
            if let Some(sf) = update.scheduled_for {
                job.scheduled_for = Some(sf);
            }
            job.updated_at = now;
            if matches!(status, JobStatus::Running) {
                job.started_at.get_or_insert(now);
            }
            if status.is_terminal() {
                job.completed_at.get_or_insert(now);
            }
        }
        state.history.push(JobHistoryEntry {
            job_id,
            status: status.as_str().to_string(),
            timestamp: now,
            details: history_details.map(truncate_details),
        });
        drop(state);

        if !extracted_screenshots.is_empty() {
            self.save_screenshots(job_id, extracted_screenshots).await?;
        }
        Ok(())
    }

    async fn recover_stale_locks(&self, max_age: std::time::Duration) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::from_std(max_age)?;
        let mut state = self.state.lock().await;
        let mut recovered = 0usize;
        let ids: Vec<i64> = state
            .jobs
            .values()
            .filter(|j| {
                j.lock_id.is_some()
                    && j.locked_at.map(|t| t < cutoff).unwrap_or(false)
                    && matches!(
                        j.status,
                        JobStatus::Dispatching | JobStatus::Running | JobStatus::RetryPending
                    )
            })
            .map(|j| j.id)
            .collect();

        for id in ids {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.lock_id = None;
                job.locked_at = None;
                if matches!(job.status, JobStatus::Running) && job.retry_count < job.max_retries {
                    job.retry_count += 1;
                    job.status = JobStatus::RetryPending;
                } else {
                    job.status = JobStatus::Pending;
                }
                job.updated_at = Utc::now();
                recovered += 1;
            }
            state.history.push(JobHistoryEntry {
                job_id: id,
                status: "recovered".to_string(),
                timestamp: Utc::now(),
                details: Some("stale lease reclaimed".to_string()),
            });
        }
        Ok(recovered)
    }

    async fn save_screenshots(
        &self,
        job_id: i64,
        screenshots: Vec<RawScreenshot>,
    ) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let mut saved = 0usize;
        for shot in screenshots {
            let (Some(name), Some(data)) = (shot.name, shot.base64_data) else {
                continue;
            };
            if state
                .screenshots
                .iter()
                .any(|s| s.job_id == job_id && s.name == name)
            {
                continue;
            }
            state.screenshots.push(Screenshot {
                job_id,
                name,
                mime_type: shot.mime_type,
                description: shot.description,
                timestamp: Utc::now(),
                image_data: data,
            });
            saved += 1;
        }
        Ok(saved)
    }

    async fn get_screenshots(&self, job_id: i64) -> anyhow::Result<Vec<Screenshot>> {
        Ok(self
            .state
            .lock()
            .await
            .screenshots
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_history(&self, job_id: i64) -> anyhow::Result<Vec<JobHistoryEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .iter()
            .filter(|h| h.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn cancel_job(&self, job_id: i64) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !job.status.is_cancellable() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.lock_id = None;
        job.locked_at = None;
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        job.result = Some(serde_json::json!({ "cancelled": true }));
        state.history.push(JobHistoryEntry {
            job_id,
            status: "cancelled".to_string(),
            timestamp: Utc::now(),
            details: Some("cancelled via API".to_string()),
        });
        Ok(true)
    }

    async fn save_metric_sample(&self, sample: SystemMetricSample) -> anyhow::Result<()> {
        self.state.lock().await.metrics.push(sample);
        Ok(())
    }

    async fn recent_metric_samples(&self, limit: i64) -> anyhow::Result<Vec<SystemMetricSample>> {
        let state = self.state.lock().await;
        let mut samples = state.metrics.clone();
        samples.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
        samples.truncate(limit.max(0) as usize);
        Ok(samples)
    }

    async fn cleanup_evidence(
        &self,
        retention: ChronoDuration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let cutoff = now - retention;
        let mut state = self.state.lock().await;
        let expired_ids: Vec<i64> = state
            .jobs
            .values()
            .filter(|j| j.completed_at.map(|c| c < cutoff).unwrap_or(false))
            .map(|j| j.id)
            .collect();
        let before = state.screenshots.len();
        state
            .screenshots
            .retain(|s| !expired_ids.contains(&s.job_id));
        Ok(before - state.screenshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, Provider};

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            external_job_id: Some("ext-1".into()),
            provider: Provider::Mfn,
            action: Action::Validation,
            parameters: serde_json::json!({}),
            priority: 0,
            max_retries: None,
            scheduled_for: None,
        }
    }

    #[tokio::test]
    async fn lock_acquisition_is_exclusive() {
        let store = MemoryPersistence::new();
        let job = store.create_job(descriptor()).await.unwrap();

        let lock_a = Uuid::new_v4();
        let lock_b = Uuid::new_v4();
        assert!(store.acquire_lock(job.id, lock_a).await.unwrap());
        assert!(!store.acquire_lock(job.id, lock_b).await.unwrap());
    }

    #[tokio::test]
    async fn release_lock_requires_matching_holder() {
        let store = MemoryPersistence::new();
        let job = store.create_job(descriptor()).await.unwrap();
        let lock_a = Uuid::new_v4();
        store.acquire_lock(job.id, lock_a).await.unwrap();

        assert!(!store
            .release_lock(job.id, Uuid::new_v4(), JobStatus::Completed)
            .await
            .unwrap());
        assert!(store
            .release_lock(job.id, lock_a, JobStatus::Completed)
            .await
            .unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_jobs() {
        let store = MemoryPersistence::new();
        let job = store.create_job(descriptor()).await.unwrap();
        let lock = Uuid::new_v4();
        store.acquire_lock(job.id, lock).await.unwrap();
        store
            .release_lock(job.id, lock, JobStatus::Completed)
            .await
            .unwrap();

        assert!(!store.cancel_job(job.id).await.unwrap());
    }
}
