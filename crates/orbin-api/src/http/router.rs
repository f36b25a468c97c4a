//! Axum router configuration with middleware.
//!
//! Management routes are under `/api/v1/` and scoped by the
//! `X-Orbin-Organization` header. Webhook deliveries arrive on `/hooks/*`.
//! Middleware: CORS, gzip compression, tracing.

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflow definitions
        .route(
            "/workflows",
            get(handlers::workflow::list_workflows).post(handlers::workflow::save_workflow),
        )
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route(
            "/workflows/{id}/status",
            put(handlers::workflow::set_workflow_status),
        )
        .route(
            "/workflows/{id}/runs",
            post(handlers::workflow::trigger_workflow),
        )
        // Runs
        .route("/runs", get(handlers::run::list_runs))
        .route("/runs/{id}", get(handlers::run::get_run))
        .route("/runs/{id}/cancel", post(handlers::run::cancel_run))
        .route("/runs/{id}/replay", post(handlers::run::replay_run))
        .route(
            "/runs/{id}/steps/{step_id}/result",
            post(handlers::run::report_step_result),
        )
        // Internal events
        .route(
            "/events",
            get(handlers::event::list_events).post(handlers::event::publish_event),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/hooks/{*path}", post(handlers::hook::receive_webhook))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness probe.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
