//! Scheduler (spec.md §4.7, component F).
//!
//! Wraps `tokio_cron_scheduler::JobScheduler` the way the teacher's
//! `kernel/scheduled_tasks.rs` does, running the recurring maintenance
//! tasks. `tokio-cron-scheduler` does not itself coalesce missed runs or
//! cap concurrent instances, so each task guards its body with a
//! `try_acquire` on a per-task `tokio::sync::Mutex` — a run that finds the
//! guard held logs and returns immediately, reproducing
//! "coalesce: true, max_instances: 1" without pulling in a crate the rest
//! of the pack doesn't use.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::domain::{JobStatus, SystemMetricSample};
use crate::persistence::{JobFilter, PersistenceLayer};
use crate::worker_directory::WorkerDirectory;

pub struct Scheduler {
    config: Config,
    store: Arc<dyn PersistenceLayer>,
    dispatcher: Arc<Dispatcher>,
    directory: Arc<WorkerDirectory>,
    handle: Mutex<Option<JobScheduler>>,
}

/// Per-task exclusion guard emulating max_instances=1.
struct TaskGuard(Arc<Mutex<()>>);

impl TaskGuard {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(())))
    }

    fn try_enter(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }
}

impl Scheduler {
    pub fn new(
        config: Config,
        store: Arc<dyn PersistenceLayer>,
        dispatcher: Arc<Dispatcher>,
        directory: Arc<WorkerDirectory>,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            directory,
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let sched = self.build().await?;
        sched.start().await?;
        *self.handle.lock().await = Some(sched);
        Ok(())
    }

    /// Administrative reset (§4.7, §9): stop the existing scheduler,
    /// rebuild the job list, and restart — reconstructed rather than
    /// patched in place, to avoid duplicated executions across reload
    /// boundaries.
    pub async fn reset(&self) -> anyhow::Result<()> {
        if let Some(mut sched) = self.handle.lock().await.take() {
            let _ = sched.shutdown().await;
        }
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    async fn build(&self) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await?;

        sched.add(self.queue_poll_task()?).await?;
        sched.add(self.worker_status_poll_task()?).await?;
        sched.add(self.metrics_sample_task()?).await?;
        sched.add(self.stale_lease_task()?).await?;
        sched.add(self.evidence_cleanup_task()?).await?;
        if self.config.health_report_interval.is_some() {
            if let Some(task) = self.health_report_task()? {
                sched.add(task).await?;
            }
        }

        Ok(sched)
    }

    fn queue_poll_task(&self) -> anyhow::Result<CronJob> {
        let dispatcher = self.dispatcher.clone();
        let guard = TaskGuard::new();
        let cron = seconds_cron(self.config.job_poll_interval);
        Ok(CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let dispatcher = dispatcher.clone();
            let permit = guard.try_enter();
            Box::pin(async move {
                let Some(_permit) = permit else {
                    tracing::debug!("queue poll skipped: previous run still in flight");
                    return;
                };
                if let Err(err) = dispatcher.poll_once().await {
                    tracing::error!(error = %err, "queue poll failed");
                }
            })
        })?)
    }

    fn worker_status_poll_task(&self) -> anyhow::Result<CronJob> {
        let dispatcher = self.dispatcher.clone();
        let guard = TaskGuard::new();
        let cron = seconds_cron(self.config.worker_poll_interval);
        Ok(CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let dispatcher = dispatcher.clone();
            let permit = guard.try_enter();
            Box::pin(async move {
                let Some(_permit) = permit else {
                    tracing::debug!("worker status poll skipped: previous run still in flight");
                    return;
                };
                if let Err(err) = dispatcher.reconcile_once().await {
                    tracing::error!(error = %err, "worker status poll failed");
                }
            })
        })?)
    }

    fn metrics_sample_task(&self) -> anyhow::Result<CronJob> {
        let store = self.store.clone();
        let directory = self.directory.clone();
        let guard = TaskGuard::new();
        let cron = seconds_cron(self.config.metrics_interval);
        Ok(CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let store = store.clone();
            let directory = directory.clone();
            let permit = guard.try_enter();
            Box::pin(async move {
                let Some(_permit) = permit else {
                    tracing::debug!("metrics sample skipped: previous run still in flight");
                    return;
                };
                if let Err(err) = sample_metrics(store.as_ref(), directory.as_ref()).await {
                    tracing::error!(error = %err, "metrics sample failed");
                }
            })
        })?)
    }

    fn stale_lease_task(&self) -> anyhow::Result<CronJob> {
        let store = self.store.clone();
        let max_age = self.config.stale_lease_max_age;
        let guard = TaskGuard::new();
        let cron = seconds_cron(self.config.stale_lease_interval);
        Ok(CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let store = store.clone();
            let permit = guard.try_enter();
            Box::pin(async move {
                let Some(_permit) = permit else {
                    tracing::debug!("stale-lease recovery skipped: previous run still in flight");
                    return;
                };
                match store.recover_stale_locks(max_age).await {
                    Ok(n) if n > 0 => tracing::info!(recovered = n, "stale leases reclaimed"),
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "stale-lease recovery failed"),
                }
            })
        })?)
    }

    fn evidence_cleanup_task(&self) -> anyhow::Result<CronJob> {
        let store = self.store.clone();
        let retention = ChronoDuration::days(self.config.evidence_retention_days);
        let guard = TaskGuard::new();
        let cron = format!("0 0 {} * * *", self.config.cleanup_hour);
        Ok(CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let store = store.clone();
            let permit = guard.try_enter();
            Box::pin(async move {
                let Some(_permit) = permit else {
                    tracing::debug!("evidence cleanup skipped: previous run still in flight");
                    return;
                };
                match store.cleanup_evidence(retention, chrono::Utc::now()).await {
                    Ok(n) => tracing::info!(purged = n, "evidence cleanup complete"),
                    Err(err) => tracing::error!(error = %err, "evidence cleanup failed"),
                }
            })
        })?)
    }

    fn health_report_task(&self) -> anyhow::Result<Option<CronJob>> {
        let Some(interval) = self.config.health_report_interval else {
            return Ok(None);
        };
        let directory = self.directory.clone();
        let guard = TaskGuard::new();
        let cron = seconds_cron(interval);
        Ok(Some(CronJob::new_async(cron.as_str(), move |_uuid, _l| {
            let directory = directory.clone();
            let permit = guard.try_enter();
            Box::pin(async move {
                let Some(_permit) = permit else {
                    return;
                };
                let pool = directory.available_pool().await;
                tracing::info!(healthy = pool.len(), "worker health report");
            })
        })?))
    }
}

async fn sample_metrics(
    store: &dyn PersistenceLayer,
    directory: &WorkerDirectory,
) -> anyhow::Result<()> {
    let queued = store
        .list_jobs(JobFilter { status: Some(JobStatus::Pending), limit: i64::MAX, offset: 0 })
        .await?
        .len() as i64;
    let running = store
        .list_jobs(JobFilter { status: Some(JobStatus::Running), limit: i64::MAX, offset: 0 })
        .await?
        .len() as i64;
    let completed = store
        .list_jobs(JobFilter { status: Some(JobStatus::Completed), limit: i64::MAX, offset: 0 })
        .await?
        .len() as i64;
    let failed = store
        .list_jobs(JobFilter { status: Some(JobStatus::Failed), limit: i64::MAX, offset: 0 })
        .await?
        .len() as i64;

    let healthy = directory.available_pool().await;
    let worker_status = directory
        .configured_endpoints()
        .iter()
        .map(|ep| {
            let status = if healthy.contains(ep) { "up" } else { "down" };
            (ep.clone(), status.to_string())
        })
        .collect();

    store
        .save_metric_sample(SystemMetricSample {
            timestamp: chrono::Utc::now(),
            queued,
            running,
            completed,
            failed,
            worker_status,
        })
        .await
}

/// Builds a 7-field (seconds-resolution) cron expression firing every
/// `interval`, for sub-minute tasks like the 5s queue poll.
fn seconds_cron(interval: Duration) -> String {
    let secs = interval.as_secs().max(1);
    if secs < 60 {
        format!("*/{secs} * * * * *")
    } else {
        format!("0 */{} * * * *", (secs / 60).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_cron_sub_minute() {
        assert_eq!(seconds_cron(Duration::from_secs(5)), "*/5 * * * * *");
    }

    #[test]
    fn seconds_cron_minutes() {
        assert_eq!(seconds_cron(Duration::from_secs(600)), "0 */10 * * * *");
    }
}
