//! Reference Worker Service (spec.md §4.8, component J) — interface only.
//!
//! Implements the three worker endpoints and the per-(provider, action)
//! required-parameter validation table. Does NOT drive any real browser
//! automation — `/execute` delegates to a pluggable `ProviderAdapter`
//! whose only shipped implementation is a synthetic stub, so the
//! orchestrator's dispatch/retry/standardize/report pipeline can be
//! exercised end-to-end without a real fleet of portal-automation workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Provider {
    Mfn,
    Osn,
    Octotel,
    Evotel,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Action {
    Validation,
    Cancellation,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    job_id: i64,
    provider: Provider,
    action: Action,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
}

/// Required-parameter table from spec.md §4.8. `evotel` additionally
/// accepts legacy `serial_number` as an alias for `circuit_number`.
fn required_params(provider: Provider, action: Action) -> &'static [&'static str] {
    match (provider, action) {
        (_, Action::Validation) => &["circuit_number"],
        (Provider::Mfn, Action::Cancellation) => &["circuit_number"],
        (Provider::Osn, Action::Cancellation) => &["circuit_number", "solution_id"],
        (Provider::Octotel, Action::Cancellation) => &["circuit_number", "solution_id"],
        (Provider::Evotel, Action::Cancellation) => &["circuit_number"],
    }
}

fn normalize_evotel_alias(provider: Provider, parameters: &mut serde_json::Map<String, Value>) {
    if provider == Provider::Evotel && !parameters.contains_key("circuit_number") {
        if let Some(serial) = parameters.get("serial_number").cloned() {
            parameters.insert("circuit_number".to_string(), serial);
        }
    }
}

/// Stand-in for a real per-provider RPA adapter: produces a
/// canonical-shaped synthetic result so the pipeline downstream of this
/// worker can be exercised without real browser automation.
trait ProviderAdapter: Send + Sync {
    fn execute(&self, provider: Provider, action: Action, parameters: &Value) -> Value;
}

struct SyntheticAdapter;

impl ProviderAdapter for SyntheticAdapter {
    fn execute(&self, _provider: Provider, action: Action, parameters: &Value) -> Value {
        let circuit = parameters
            .get("circuit_number")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN");

        match action {
            Action::Validation => json!({
                "details": { "service_found": true, "is_active": true },
                "circuit_number": circuit,
            }),
            Action::Cancellation => json!({
                "cancellation_submitted": true,
                "release_reference": format!("SYN-{circuit}"),
            }),
        }
    }
}

struct AppState {
    adapter: Arc<dyn ProviderAdapter>,
    active_jobs: Arc<AtomicI64>,
    job_store: Arc<Mutex<HashMap<i64, Value>>>,
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Json<Value> {
    let mut parameters = Value::Object(req.parameters);
    if let Some(obj) = parameters.as_object_mut() {
        normalize_evotel_alias(req.provider, obj);
    }

    let required = required_params(req.provider, req.action);
    let missing: Vec<&str> = required
        .iter()
        .filter(|p| {
            parameters
                .get(**p)
                .and_then(Value::as_str)
                .map(str::is_empty)
                .unwrap_or(true)
        })
        .copied()
        .collect();

    if !missing.is_empty() {
        return Json(json!({
            "status": "error",
            "job_id": req.job_id,
            "result": { "error": format!("missing required parameters: {}", missing.join(", ")) },
        }));
    }

    state.active_jobs.fetch_add(1, Ordering::SeqCst);
    let result = state.adapter.execute(req.provider, req.action, &parameters);
    state.active_jobs.fetch_sub(1, Ordering::SeqCst);

    let response = json!({ "status": "success", "job_id": req.job_id, "result": result });
    state.job_store.lock().await.insert(req.job_id, response.clone());
    Json(response)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "up",
        "timestamp": chrono::Utc::now(),
        "active_jobs": state.active_jobs.load(Ordering::SeqCst),
    }))
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> Json<Value> {
    match state.job_store.lock().await.get(&job_id) {
        Some(resp) => Json(resp.clone()),
        None => Json(json!({ "job_id": job_id, "status": "not_found" })),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(AppState {
        adapter: Arc::new(SyntheticAdapter),
        active_jobs: Arc::new(AtomicI64::new(0)),
        job_store: Arc::new(Mutex::new(HashMap::new())),
    });

    let app = Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .route("/status/:job_id", get(status))
        .with_state(state);

    let addr = std::env::var("WORKER_BIND").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    tracing::info!(%addr, "reference worker listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
