//! End-to-end coverage of the dispatch/retry/standardize/report pipeline
//! against `MemoryPersistence` and a lightweight mock worker, exercising
//! the scenarios named in spec.md §8.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use orchestrator_core::dispatcher::{Dispatcher, DispatcherConfig};
use orchestrator_core::domain::{Action, JobDescriptor, JobStatus, Provider};
use orchestrator_core::persistence::{MemoryPersistence, PersistenceLayer};
use orchestrator_core::reporter::Reporter;
use orchestrator_core::standardize::RawProviderResult;
use orchestrator_core::status_mapper::map_status;
use orchestrator_core::worker_directory::WorkerDirectory;
use serde_json::{json, Value};

/// Spawns a mock worker on a loopback port. `behavior` decides the
/// `/execute` response for every call; `/health` always answers 2xx.
async fn spawn_mock_worker(
    behavior: impl Fn(usize) -> (u16, Value) + Send + Sync + 'static,
) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let behavior = Arc::new(behavior);

    #[derive(Clone)]
    struct WorkerState {
        calls: Arc<AtomicUsize>,
        behavior: Arc<dyn Fn(usize) -> (u16, Value) + Send + Sync>,
    }

    async fn execute(State(state): State<WorkerState>) -> (axum::http::StatusCode, Json<Value>) {
        let n = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (status, body) = (state.behavior)(n);
        (axum::http::StatusCode::from_u16(status).unwrap(), Json(body))
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "up" }))
    }

    let state = WorkerState { calls: calls.clone(), behavior };
    let app = Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/execute"), calls)
}

fn test_dispatcher(
    store: Arc<dyn PersistenceLayer>,
    worker_url: String,
    max_retry_attempts: i32,
    retry_delay: Duration,
) -> Dispatcher {
    let directory = Arc::new(WorkerDirectory::new(vec![worker_url], Duration::from_secs(1)));
    let reporter = Arc::new(Reporter::new(None, Duration::from_secs(1)));
    Dispatcher::new(
        store,
        directory,
        reporter,
        DispatcherConfig {
            max_workers: 4,
            batch_size: 10,
            worker_timeout: Duration::from_secs(5),
            max_retry_attempts,
            retry_delay,
        },
    )
}

#[tokio::test]
async fn happy_validation_reaches_completed_and_maps_to_validated() {
    let store: Arc<dyn PersistenceLayer> = Arc::new(MemoryPersistence::new());
    let (worker_url, calls) = spawn_mock_worker(|_n| {
        (
            200,
            json!({
                "status": "success",
                "result": { "details": { "service_found": true, "is_active": true } },
            }),
        )
    })
    .await;

    let job = store
        .create_job(JobDescriptor {
            external_job_id: Some("FTTX546612".to_string()),
            provider: Provider::Mfn,
            action: Action::Validation,
            parameters: json!({ "circuit_number": "FTTX546612" }),
            priority: 5,
            max_retries: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    let dispatcher = test_dispatcher(store.clone(), worker_url, 3, Duration::from_secs(60));
    dispatcher.poll_once().await.unwrap();

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let canonical =
        RawProviderResult::for_provider(job.provider, job.result.clone().unwrap()).extract_canonical();
    let status = map_status(job.status, job.action, &canonical, None);
    assert_eq!(status, "Bitstream Validated");
}

#[tokio::test]
async fn retry_exhaustion_ends_in_error_with_bounded_retry_count() {
    let store: Arc<dyn PersistenceLayer> = Arc::new(MemoryPersistence::new());
    let (worker_url, calls) = spawn_mock_worker(|_n| (500, json!({ "detail": "internal error" }))).await;

    let job = store
        .create_job(JobDescriptor {
            external_job_id: None,
            provider: Provider::Osn,
            action: Action::Validation,
            parameters: json!({ "circuit_number": "C1" }),
            priority: 0,
            max_retries: Some(2),
            scheduled_for: None,
        })
        .await
        .unwrap();

    let retry_delay = Duration::from_millis(5);
    let dispatcher = test_dispatcher(store.clone(), worker_url, 1, retry_delay);

    dispatcher.poll_once().await.unwrap();
    let after_first = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::RetryPending);
    assert_eq!(after_first.retry_count, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    dispatcher.poll_once().await.unwrap();

    let final_job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Error);
    assert!(final_job.retry_count <= final_job.max_retries);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let canonical = RawProviderResult::for_provider(final_job.provider, json!({})).extract_canonical();
    let status = map_status(final_job.status, final_job.action, &canonical, None);
    assert_eq!(status, "Bitstream Validation Error");
}

#[tokio::test]
async fn cancellation_before_dispatch_never_calls_worker() {
    let store: Arc<dyn PersistenceLayer> = Arc::new(MemoryPersistence::new());
    let (worker_url, calls) = spawn_mock_worker(|_n| (200, json!({ "status": "success" }))).await;

    let job = store
        .create_job(JobDescriptor {
            external_job_id: None,
            provider: Provider::Evotel,
            action: Action::Cancellation,
            parameters: json!({ "circuit_number": "C2" }),
            priority: 0,
            max_retries: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    assert!(store.cancel_job(job.id).await.unwrap());
    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    let _dispatcher = test_dispatcher(store.clone(), worker_url, 1, Duration::from_secs(60));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_lease_recovery_reclaims_dead_holder() {
    let store: Arc<dyn PersistenceLayer> = Arc::new(MemoryPersistence::new());
    let job = store
        .create_job(JobDescriptor {
            external_job_id: None,
            provider: Provider::Octotel,
            action: Action::Validation,
            parameters: json!({ "circuit_number": "C3" }),
            priority: 0,
            max_retries: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    let lock_id = uuid::Uuid::new_v4();
    assert!(store.acquire_lock(job.id, lock_id).await.unwrap());
    store
        .update_job_status(
            job.id,
            JobStatus::Running,
            Default::default(),
            Some("leased".to_string()),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let recovered = store.recover_stale_locks(Duration::from_millis(1)).await.unwrap();
    assert_eq!(recovered, 1);

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert!(job.lock_id.is_none());
    assert!(matches!(job.status, JobStatus::RetryPending | JobStatus::Pending));
}

/// Spawns a mock worker serving only `GET /status/<job_id>`, for exercising
/// the passive-reconciliation sweep independently of `/execute`.
async fn spawn_mock_status_worker(status: &'static str, result: Value) -> String {
    async fn status_handler(
        State(state): State<(&'static str, Value)>,
    ) -> Json<Value> {
        Json(json!({ "status": state.0, "result": state.1 }))
    }

    let app = Router::new()
        .route("/status/:id", get(status_handler))
        .with_state((status, result));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}/execute")
}

#[tokio::test]
async fn reconciliation_of_completed_job_releases_the_lease() {
    let store: Arc<dyn PersistenceLayer> = Arc::new(MemoryPersistence::new());
    let worker_url = spawn_mock_status_worker("completed", json!({ "details": { "service_found": true, "is_active": true } })).await;

    let job = store
        .create_job(JobDescriptor {
            external_job_id: None,
            provider: Provider::Mfn,
            action: Action::Validation,
            parameters: json!({ "circuit_number": "C4" }),
            priority: 0,
            max_retries: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    let lock_id = uuid::Uuid::new_v4();
    assert!(store.acquire_lock(job.id, lock_id).await.unwrap());
    store
        .update_job_status(
            job.id,
            JobStatus::Running,
            orchestrator_core::persistence::StatusUpdate {
                assigned_worker: Some(worker_url),
                ..Default::default()
            },
            Some("leased".to_string()),
        )
        .await
        .unwrap();

    let dispatcher = test_dispatcher(store.clone(), "http://unused/execute".to_string(), 1, Duration::from_secs(60));
    let reconciled = dispatcher.reconcile_once().await.unwrap();
    assert_eq!(reconciled, 1);

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.lock_id.is_none());
    assert!(job.locked_at.is_none());
}

#[tokio::test]
async fn reconciliation_of_errored_job_releases_the_lease() {
    let store: Arc<dyn PersistenceLayer> = Arc::new(MemoryPersistence::new());
    let worker_url = spawn_mock_status_worker("error", json!({ "error": "portal unresponsive" })).await;

    let job = store
        .create_job(JobDescriptor {
            external_job_id: None,
            provider: Provider::Octotel,
            action: Action::Validation,
            parameters: json!({ "circuit_number": "C5" }),
            priority: 0,
            max_retries: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    let lock_id = uuid::Uuid::new_v4();
    assert!(store.acquire_lock(job.id, lock_id).await.unwrap());
    store
        .update_job_status(
            job.id,
            JobStatus::Dispatching,
            orchestrator_core::persistence::StatusUpdate {
                assigned_worker: Some(worker_url),
                ..Default::default()
            },
            Some("leased".to_string()),
        )
        .await
        .unwrap();

    let dispatcher = test_dispatcher(store.clone(), "http://unused/execute".to_string(), 1, Duration::from_secs(60));
    let reconciled = dispatcher.reconcile_once().await.unwrap();
    assert_eq!(reconciled, 1);

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.lock_id.is_none());
    assert!(job.locked_at.is_none());
}
