//! Cancellation via the Public API releases the lease and fires an
//! external report (spec.md §4.9 `DELETE /jobs/{id}`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use orchestrator_core::api::{build_router, AppState};
use orchestrator_core::config::Config;
use orchestrator_core::dispatcher::{Dispatcher, DispatcherConfig};
use orchestrator_core::domain::{Action, JobDescriptor, Provider};
use orchestrator_core::persistence::{MemoryPersistence, PersistenceLayer};
use orchestrator_core::reporter::Reporter;
use orchestrator_core::scheduler::Scheduler;
use orchestrator_core::worker_directory::WorkerDirectory;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn spawn_mock_callback() -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    async fn receive(
        axum::extract::State(calls): axum::extract::State<Arc<AtomicUsize>>,
        Json(_body): Json<Value>,
    ) -> axum::http::StatusCode {
        calls.fetch_add(1, Ordering::SeqCst);
        axum::http::StatusCode::OK
    }

    let app = Router::new().route("/callback", post(receive)).with_state(calls_clone);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/callback"), calls)
}

#[tokio::test]
async fn cancelling_a_pending_job_fires_one_external_report() {
    let (callback_url, calls) = spawn_mock_callback().await;

    let store: Arc<dyn PersistenceLayer> = Arc::new(MemoryPersistence::new());
    let directory = Arc::new(WorkerDirectory::new(vec![], Duration::from_secs(1)));
    let reporter = Arc::new(Reporter::new(Some(callback_url), Duration::from_secs(5)));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        directory.clone(),
        reporter.clone(),
        DispatcherConfig {
            max_workers: 1,
            batch_size: 10,
            worker_timeout: Duration::from_secs(5),
            max_retry_attempts: 1,
            retry_delay: Duration::from_secs(60),
        },
    ));

    let mut config = Config::from_env().unwrap_or_else(|_| {
        // Falls back to defaults in an environment with no DATABASE_URL set.
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        Config::from_env().unwrap()
    });
    config.callback_endpoint = None; // the reporter is configured independently above

    let scheduler = Arc::new(Scheduler::new(config, store.clone(), dispatcher.clone(), directory));

    let state = AppState { store: store.clone(), dispatcher, scheduler, reporter };
    let app = build_router(state);

    let job = store
        .create_job(JobDescriptor {
            external_job_id: Some("EXT-1".to_string()),
            provider: Provider::Mfn,
            action: Action::Cancellation,
            parameters: json!({ "circuit_number": "C1" }),
            priority: 0,
            max_retries: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    let request = axum::http::Request::builder()
        .method("DELETE")
        .uri(format!("/jobs/{}", job.id))
        .body(axum::body::Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert!(job.status.is_terminal());
    assert!(job.lock_id.is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
