//! HTTP handlers for the Public API (spec.md §4.9).

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::{JobDescriptor, JobHistoryEntry, JobStatus, Screenshot, ScreenshotMeta};
use crate::error::ApiError;
use crate::persistence::{JobFilter, StatusUpdate};
use crate::standardize::RawProviderResult;
use crate::status_mapper::map_status;

use super::state::AppState;

pub async fn create_job(
    State(state): State<AppState>,
    Json(descriptor): Json<JobDescriptor>,
) -> Result<Json<Value>, ApiError> {
    if descriptor.priority < 0 || descriptor.priority > 10 {
        return Err(ApiError::Validation("priority must be between 0 and 10".into()));
    }
    let job = state.store.create_job(descriptor).await?;
    Ok(Json(json!(job)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let job = state.store.get_job(id).await?.ok_or(ApiError::NotFound(id))?;
    Ok(Json(json!(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Value>, ApiError> {
    let jobs = state
        .store
        .list_jobs(JobFilter {
            status: query.status,
            limit: query.limit.unwrap_or(50),
            offset: query.offset.unwrap_or(0),
        })
        .await?;
    Ok(Json(json!(jobs)))
}

#[derive(Debug, Deserialize)]
pub struct PatchJobBody {
    pub status: JobStatus,
    pub result: Option<Value>,
    pub evidence: Option<Vec<String>>,
}

pub async fn patch_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<PatchJobBody>,
) -> Result<Json<Value>, ApiError> {
    state.store.get_job(id).await?.ok_or(ApiError::NotFound(id))?;
    state
        .store
        .update_job_status(
            id,
            body.status,
            StatusUpdate {
                result: body.result,
                evidence: body.evidence,
                ..Default::default()
            },
            Some("admin update via PATCH /jobs/{id}".to_string()),
        )
        .await?;
    let job = state.store.get_job(id).await?.ok_or(ApiError::NotFound(id))?;
    Ok(Json(json!(job)))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let job = state.store.get_job(id).await?.ok_or(ApiError::NotFound(id))?;
    if !job.status.is_cancellable() {
        return Err(ApiError::Validation(format!(
            "job {id} is not in a cancellable state ({})",
            job.status.as_str()
        )));
    }
    state.store.cancel_job(id).await?;
    let job = state.store.get_job(id).await?.ok_or(ApiError::NotFound(id))?;

    let raw = RawProviderResult::for_provider(job.provider, job.result.clone().unwrap_or(Value::Null));
    let canonical = raw.extract_canonical();
    let status_label = map_status(job.status, job.action, &canonical, None);
    state.reporter.report(&job, &status_label, &canonical, "cancelled").await?;

    Ok(Json(json!(job)))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let job = state.store.get_job(id).await?.ok_or(ApiError::NotFound(id))?;
    let mut history = state.store.get_history(id).await?;
    if history.is_empty() {
        history.push(JobHistoryEntry {
            job_id: id,
            status: job.status.as_str().to_string(),
            timestamp: job.updated_at,
            details: Some("synthetic entry: no history rows recorded".to_string()),
        });
    }
    Ok(Json(json!(history)))
}

#[derive(Debug, Deserialize)]
pub struct ScreenshotsQuery {
    #[serde(default)]
    pub include_data: bool,
}

pub async fn get_screenshots(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ScreenshotsQuery>,
) -> Result<Json<Value>, ApiError> {
    let shots: Vec<Screenshot> = state.store.get_screenshots(id).await?;
    if query.include_data {
        Ok(Json(json!(shots)))
    } else {
        let meta: Vec<ScreenshotMeta> = shots.iter().map(ScreenshotMeta::from).collect();
        Ok(Json(json!(meta)))
    }
}

pub async fn force_process(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let n = state.dispatcher.poll_once().await?;
    Ok(Json(json!({ "dispatched": n })))
}

pub async fn force_recover(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let n = state.store.recover_stale_locks(std::time::Duration::from_secs(0)).await?;
    Ok(Json(json!({ "recovered": n })))
}

pub async fn scheduler_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "running": state.scheduler.is_running().await }))
}

pub async fn scheduler_reset(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.scheduler.reset().await?;
    Ok(Json(json!({ "running": true })))
}

pub async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let samples = state.store.recent_metric_samples(100).await?;
    Ok(Json(json!({ "samples": samples })))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": chrono::Utc::now() }))
}
