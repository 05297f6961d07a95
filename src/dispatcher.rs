//! Dispatcher (spec.md §4.4, component D).
//!
//! Polls the queue, leases jobs onto a bounded pool of dispatch tasks,
//! submits them to workers, interprets responses, and drives the
//! standardize/map/report pipeline on terminal outcomes. Also runs the
//! passive-reconciliation sweep described in §4.4.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::{Job, JobStatus};
use crate::persistence::{PersistenceLayer, StatusUpdate};
use crate::reporter::Reporter;
use crate::retry;
use crate::standardize::RawProviderResult;
use crate::status_mapper::{classify_failure_kind, map_status};
use crate::worker_directory::{self, WorkerDirectory};

pub struct DispatcherConfig {
    pub max_workers: usize,
    pub batch_size: i64,
    pub worker_timeout: Duration,
    pub max_retry_attempts: i32,
    pub retry_delay: Duration,
}

pub struct Dispatcher {
    store: Arc<dyn PersistenceLayer>,
    directory: Arc<WorkerDirectory>,
    reporter: Arc<Reporter>,
    client: reqwest::Client,
    config: DispatcherConfig,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PersistenceLayer>,
        directory: Arc<WorkerDirectory>,
        reporter: Arc<Reporter>,
        config: DispatcherConfig,
    ) -> Self {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_workers.max(1)));
        Self {
            store,
            directory,
            reporter,
            client: reqwest::Client::new(),
            config,
            semaphore,
        }
    }

    /// One queue-poll tick: lease a batch of eligible jobs and submit one
    /// dispatch task per job, bounded by the semaphore.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let jobs = self.store.get_pending_jobs(self.config.batch_size).await?;
        let pool = self.directory.available_pool().await;
        let mut dispatched = 0usize;

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = self.semaphore.clone().acquire_owned().await?;
            let ctx = DispatchCtx {
                store: self.store.clone(),
                reporter: self.reporter.clone(),
                client: self.client.clone(),
                pool: pool.clone(),
                worker_timeout: self.config.worker_timeout,
                max_retry_attempts: self.config.max_retry_attempts,
                retry_delay: self.config.retry_delay,
            };

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                dispatch_one(&ctx, job).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => dispatched += 1,
                Ok(Err(err)) => tracing::error!(error = %err, "dispatch task failed"),
                Err(err) => tracing::error!(error = %err, "dispatch task panicked"),
            }
        }

        Ok(dispatched)
    }

    /// Passive reconciliation sweep (§4.4): poll `/status/<job_id>` for
    /// every `running`/`dispatching` job with an assigned worker, to
    /// recover from lost dispatch responses.
    pub async fn reconcile_once(&self) -> anyhow::Result<usize> {
        let running = self
            .store
            .list_jobs(crate::persistence::JobFilter {
                status: Some(JobStatus::Running),
                limit: 1000,
                offset: 0,
            })
            .await?;
        let dispatching = self
            .store
            .list_jobs(crate::persistence::JobFilter {
                status: Some(JobStatus::Dispatching),
                limit: 1000,
                offset: 0,
            })
            .await?;

        let mut reconciled = 0usize;
        for job in running.into_iter().chain(dispatching) {
            let Some(worker) = job.assigned_worker.clone() else {
                continue;
            };
            if self.reconcile_job(&job, &worker).await? {
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn reconcile_job(&self, job: &Job, worker: &str) -> anyhow::Result<bool> {
        let url = worker_directory::status_url(worker, job.id);
        let resp = match self.client.get(&url).timeout(self.config.worker_timeout).send().await {
            Ok(r) => r,
            Err(_) => return Ok(false),
        };
        if !resp.status().is_success() {
            return Ok(false);
        }
        let body: Value = match resp.json().await {
            Ok(b) => b,
            Err(_) => return Ok(false),
        };

        let worker_status = body.get("status").and_then(Value::as_str).unwrap_or("");
        match worker_status {
            "success" | "completed" => {
                finalize_terminal(self.store.as_ref(), self.reporter.as_ref(), job, &body, true)
                    .await?;
                self.store
                    .release_lock(job.id, job.lock_id.unwrap_or_else(Uuid::new_v4), JobStatus::Completed)
                    .await?;
                Ok(true)
            }
            "error" | "failed" => {
                finalize_terminal(self.store.as_ref(), self.reporter.as_ref(), job, &body, false)
                    .await?;
                self.store
                    .release_lock(job.id, job.lock_id.unwrap_or_else(Uuid::new_v4), JobStatus::Failed)
                    .await?;
                Ok(true)
            }
            "not_found" => {
                if job.retry_count < job.max_retries {
                    retry::handle_failure(
                        self.store.as_ref(),
                        job,
                        job.lock_id.unwrap_or_else(Uuid::new_v4),
                        "worker lost the job (status not_found)",
                        self.config.retry_delay,
                        chrono::Utc::now(),
                    )
                    .await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => Ok(false),
        }
    }
}

/// Per-task dispatch dependencies, grouped so a single task can be spawned
/// with one cheap clone rather than threading each field through.
struct DispatchCtx {
    store: Arc<dyn PersistenceLayer>,
    reporter: Arc<Reporter>,
    client: reqwest::Client,
    pool: Vec<String>,
    worker_timeout: Duration,
    max_retry_attempts: i32,
    retry_delay: Duration,
}

async fn dispatch_one(ctx: &DispatchCtx, job: Job) -> anyhow::Result<()> {
    let store = ctx.store.as_ref();
    let reporter = ctx.reporter.as_ref();
    let client = &ctx.client;
    let pool = &ctx.pool;
    let worker_timeout = ctx.worker_timeout;
    let max_retry_attempts = ctx.max_retry_attempts;
    let retry_delay = ctx.retry_delay;

    let lock_id = Uuid::new_v4();
    if !store.acquire_lock(job.id, lock_id).await? {
        return Ok(());
    }

    let Some(worker) = WorkerDirectory::select(pool, job.id) else {
        store
            .update_job_status(
                job.id,
                JobStatus::Error,
                StatusUpdate {
                    result: Some(json!({ "error": "no workers configured" })),
                    ..Default::default()
                },
                Some("no workers configured".to_string()),
            )
            .await?;
        store.release_lock(job.id, lock_id, JobStatus::Error).await?;
        return Ok(());
    };
    let worker = worker.clone();

    store
        .update_job_status(
            job.id,
            JobStatus::Dispatching,
            StatusUpdate {
                assigned_worker: Some(worker.clone()),
                ..Default::default()
            },
            Some(format!("assigned to {worker}")),
        )
        .await?;

    let mut parameters = job.parameters.clone();
    if let (Some(obj), Some(ext_id)) = (parameters.as_object_mut(), job.external_job_id.as_ref()) {
        obj.insert("external_job_id".to_string(), json!(ext_id));
    }

    let payload = json!({
        "job_id": job.id,
        "provider": job.provider,
        "action": job.action,
        "parameters": parameters,
    });

    store
        .update_job_status(job.id, JobStatus::Running, StatusUpdate::default(), None)
        .await?;

    let response = post_with_retries(client, &worker, &payload, worker_timeout, max_retry_attempts).await;

    match response {
        Ok(resp) => {
            handle_worker_response(store, reporter, &job, lock_id, resp, retry_delay).await?;
        }
        Err(err) => {
            retry::handle_failure(
                store,
                &job,
                lock_id,
                &format!("worker transport error: {err}"),
                retry_delay,
                chrono::Utc::now(),
            )
            .await?;
        }
    }

    Ok(())
}

struct WorkerResponse {
    http_status: reqwest::StatusCode,
    body: Value,
}

/// Exponential-backoff transport retry within a single dispatch attempt
/// (distinct from the job-level Retry Controller, which uses a fixed
/// `RETRY_DELAY`).
async fn post_with_retries(
    client: &reqwest::Client,
    worker_execute_url: &str,
    payload: &Value,
    timeout: Duration,
    max_attempts: i32,
) -> anyhow::Result<WorkerResponse> {
    let mut last_err = None;
    for attempt in 1..=max_attempts.max(1) {
        let result = client
            .post(worker_execute_url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await;

        match result {
            Ok(resp) => {
                let http_status = resp.status();
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                return Ok(WorkerResponse { http_status, body });
            }
            Err(err) => {
                last_err = Some(err);
                if attempt < max_attempts {
                    let delay = retry::backoff_delay(Duration::from_secs(1), attempt);
                    tokio::time::sleep(delay.to_std().unwrap_or(Duration::from_secs(1))).await;
                }
            }
        }
    }
    Err(anyhow::anyhow!(
        "worker unreachable after {max_attempts} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

async fn handle_worker_response(
    store: &dyn PersistenceLayer,
    reporter: &Reporter,
    job: &Job,
    lock_id: Uuid,
    resp: WorkerResponse,
    retry_delay: Duration,
) -> anyhow::Result<()> {
    if !resp.http_status.is_success() {
        retry::handle_failure(
            store,
            job,
            lock_id,
            &format!("worker returned {}", resp.http_status.as_u16()),
            retry_delay,
            chrono::Utc::now(),
        )
        .await?;
        return Ok(());
    }

    let top_status = resp.body.get("status").and_then(Value::as_str).unwrap_or("");
    let inner_failure = resp
        .body
        .get("result")
        .and_then(|r| r.get("status"))
        .and_then(Value::as_str)
        .map(|s| s.eq_ignore_ascii_case("failure"))
        .unwrap_or(false);

    let succeeded = !top_status.eq_ignore_ascii_case("error") && !inner_failure;
    finalize_terminal(store, reporter, job, &resp.body, succeeded).await?;

    let final_status = if succeeded { JobStatus::Completed } else { JobStatus::Failed };
    store.release_lock(job.id, lock_id, final_status).await?;
    Ok(())
}

/// Shared terminal-outcome path for both the synchronous dispatch response
/// and the passive-reconciliation sweep: persist the result, standardize,
/// map, and report.
async fn finalize_terminal(
    store: &dyn PersistenceLayer,
    reporter: &Reporter,
    job: &Job,
    body: &Value,
    succeeded: bool,
) -> anyhow::Result<()> {
    let result = body.get("result").cloned().unwrap_or(Value::Null);
    let new_status = if succeeded { JobStatus::Completed } else { JobStatus::Failed };

    store
        .update_job_status(
            job.id,
            new_status,
            StatusUpdate {
                result: Some(result.clone()),
                ..Default::default()
            },
            Some(format!("worker reported {}", if succeeded { "success" } else { "failure" })),
        )
        .await?;

    let raw = RawProviderResult::for_provider(job.provider, result);
    let canonical = raw.extract_canonical();
    let automation_status = if succeeded { "completed" } else if body.get("status").and_then(Value::as_str) == Some("error") { "worker_error" } else { "inner_failure" };
    let failure_kind = if succeeded { None } else { classify_failure_kind(body) };
    let status_label = map_status(new_status, job.action, &canonical, failure_kind);

    reporter.report(job, &status_label, &canonical, automation_status).await?;
    Ok(())
}
