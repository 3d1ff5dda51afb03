//! Request handlers.
//!
//! Each dispatch handler turns the inbound request into a
//! [`CoordinatedRequest`](fabric_common::CoordinatedRequest), runs it and
//! maps the outcome through [`FabricResponse`]. Dropping a handler future
//! (client gone, request timeout) cancels the work it started.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use fabric_common::{ExecRequest, ExecResult, ExecTarget, FabricError, ModuleName};
use fabric_dispatch::Sequence;

use crate::auth::authorize;
use crate::request::coordinated_request;
use crate::response::FabricResponse;
use crate::state::AppState;

fn route_params(identifier: &str, namespace: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("ident".to_string(), identifier.to_string()),
        ("namespace".to_string(), namespace.to_string()),
        ("name".to_string(), name.to_string()),
    ])
}

fn log_result(result: &ExecResult, start: Instant) {
    let duration_ms = start.elapsed().as_millis();
    match result.error_kind() {
        None => info!(fqmn = %result.fqmn, duration_ms, "Request completed"),
        Some(kind) => warn!(
            fqmn = %result.fqmn,
            duration_ms,
            %kind,
            status = result.http_status(),
            "Request failed"
        ),
    }
}

/// `POST /name/:ident/:namespace/:name`: run the latest revision of a module.
#[instrument(skip(state, method, uri, headers, body))]
pub async fn exec_name(
    State(state): State<AppState>,
    Path((identifier, namespace, name)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> FabricResponse {
    let start = Instant::now();
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let params = route_params(&identifier, &namespace, &name);
    let request = coordinated_request(&method, &uri, &headers, params, body);
    let target = ExecTarget::Name {
        tenant: identifier,
        namespace,
        name,
    };

    let result = state
        .dispatcher()
        .dispatch(ExecRequest::new(target, request), &cancel)
        .await;
    log_result(&result, start);
    FabricResponse::from_result(result)
}

/// `POST /ref/:ref`: run the revision with a given content ref.
///
/// With authorization enabled the ref is resolved first and the credential
/// is checked against the module's tenant.
#[instrument(skip(state, method, uri, headers, body))]
pub async fn exec_ref(
    State(state): State<AppState>,
    Path(module_ref): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> FabricResponse {
    let start = Instant::now();
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let target = ExecTarget::Ref {
        module_ref: module_ref.clone(),
    };
    let fqmn = match state.dispatcher().resolve(&target, &cancel).await {
        Ok(fqmn) => fqmn,
        Err(e) => return FabricResponse::from_error(&e),
    };
    if let Err(e) = authorize(
        &state,
        &headers,
        &fqmn.tenant,
        &fqmn.namespace,
        &fqmn.name,
        &cancel,
    )
    .await
    {
        return FabricResponse::from_error(&e);
    }

    let params = BTreeMap::from([("ref".to_string(), module_ref)]);
    let request = coordinated_request(&method, &uri, &headers, params, body);
    let result = state
        .dispatcher()
        .dispatch(ExecRequest::new(ExecTarget::Fqmn { fqmn }, request), &cancel)
        .await;
    log_result(&result, start);
    FabricResponse::from_result(result)
}

/// `POST /workflow/:ident/:namespace/:name`: run a workflow.
///
/// The response body is the output of the last step; headers set by every
/// step are returned.
#[instrument(skip(state, method, uri, headers, body))]
pub async fn run_workflow(
    State(state): State<AppState>,
    Path((identifier, namespace, name)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> FabricResponse {
    let start = Instant::now();
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let workflow_name = match ModuleName::new(identifier.as_str(), namespace.as_str(), name.as_str()) {
        Ok(module_name) => module_name,
        Err(e) => return FabricResponse::from_error(&FabricError::from(e)),
    };
    let workflow = match state.workflows().find(&workflow_name).await {
        Ok(workflow) => workflow,
        Err(e) => return FabricResponse::from_error(&e),
    };

    let params = route_params(&identifier, &namespace, &name);
    let request = coordinated_request(&method, &uri, &headers, params, body);
    let label = workflow_name.to_string();
    let result = match Sequence::new(state.executor(), &workflow, request)
        .with_step_timeout(state.step_timeout())
        .run(&cancel)
        .await
    {
        Ok(output) => ExecResult::response(label, output.output, output.resp_headers),
        Err(e) => e.into_exec_result(&label),
    };
    log_result(&result, start);
    FabricResponse::from_result(result)
}

/// `POST /exec`: run an [`ExecRequest`] and return its [`ExecResult`] as
/// JSON, for peers using a remote executor.
pub async fn exec_job(
    State(state): State<AppState>,
    Json(job): Json<ExecRequest>,
) -> impl IntoResponse {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state.dispatcher().dispatch(job, &cancel).await;
    let status = StatusCode::from_u16(result.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(result))
}

#[derive(Debug, Serialize)]
struct Health {
    healthy: bool,
}

/// `GET /health`.
pub async fn health_check() -> impl IntoResponse {
    Json(Health { healthy: true })
}

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    pools: usize,
    cached_modules: usize,
}

/// `GET /ready`: pool and module cache counts.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = state.dispatcher();
    Json(Readiness {
        ready: true,
        pools: dispatcher.pools().len(),
        cached_modules: dispatcher.modules().cached_modules(),
    })
}
