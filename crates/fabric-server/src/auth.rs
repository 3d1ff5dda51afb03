//! Bearer authorization for tenant-scoped routes.
//!
//! When the state carries an [`Authorizer`](fabric_source::Authorizer), every
//! request to `/name/...` and `/workflow/...` must present a bearer
//! credential the control plane accepts for the route's tenant identifier.
//! The resolved [`TenantInfo`] is attached to the request extensions.

use axum::extract::{Path, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fabric_common::FabricError;
use fabric_source::TenantInfo;

use crate::request::bearer_token;
use crate::response::FabricResponse;
use crate::state::AppState;

/// Check the request's credential for `identifier/namespace/name`.
///
/// Returns `Ok(None)` when authorization is disabled.
pub async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    identifier: &str,
    namespace: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<Option<TenantInfo>, FabricError> {
    let Some(authorizer) = state.authorizer() else {
        return Ok(None);
    };
    authorizer
        .authorize(bearer_token(headers), identifier, namespace, name, cancel)
        .await
        .map(Some)
}

/// Middleware for routes with `:ident/:namespace/:name` parameters.
pub async fn require_auth(
    State(state): State<AppState>,
    Path((identifier, namespace, name)): Path<(String, String, String)>,
    mut request: Request,
    next: Next,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match authorize(&state, request.headers(), &identifier, &namespace, &name, &cancel).await {
        Ok(Some(info)) => {
            debug!(tenant = %info.identifier(), %namespace, %name, "Request authorized");
            request.extensions_mut().insert(info);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(e) => {
            debug!(%identifier, %namespace, %name, error = %e, "Request rejected");
            FabricResponse::from_error(&e).into_response()
        }
    }
}
