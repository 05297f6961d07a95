//! Public API (spec.md §4.9, component I).

pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(routes::create_job).get(routes::list_jobs))
        .route(
            "/jobs/:id",
            get(routes::get_job).patch(routes::patch_job).delete(routes::cancel_job),
        )
        .route("/history/:id", get(routes::get_history))
        .route("/jobs/:id/screenshots", get(routes::get_screenshots))
        .route("/process", post(routes::force_process))
        .route("/recover", post(routes::force_recover))
        .route("/scheduler", get(routes::scheduler_status))
        .route("/scheduler/reset", post(routes::scheduler_reset))
        .route("/metrics", get(routes::metrics))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

