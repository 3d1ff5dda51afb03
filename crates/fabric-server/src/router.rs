//! HTTP router configuration.

use std::time::Duration;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::require_auth;
use crate::handler::{
    exec_job, exec_name, exec_ref, health_check, readiness_check, run_workflow,
};
use crate::state::AppState;

/// Build the application router.
///
/// Routes:
/// - `POST /name/:ident/:namespace/:name` - Run a module by name
/// - `POST /workflow/:ident/:namespace/:name` - Run a workflow
/// - `POST /ref/:ref` - Run a module by content ref
/// - `POST /exec` - Run an `ExecRequest` (peer executors)
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let tenant_routes = Router::new()
        .route("/name/:ident/:namespace/:name", post(exec_name))
        .route("/workflow/:ident/:namespace/:name", post(run_workflow))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let internal_routes = Router::new()
        .route("/ref/:ref", post(exec_ref))
        .route("/exec", post(exec_job));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check));

    Router::new()
        .merge(tenant_routes)
        .merge(internal_routes)
        .merge(health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
