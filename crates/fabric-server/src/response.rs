//! HTTP response conversion from execution results.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;
use tracing::warn;

use fabric_common::{ExecOutcome, ExecResult, FabricError};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Status, headers and body of an outgoing response.
#[derive(Debug, Clone)]
pub struct FabricResponse {
    /// HTTP status code.
    pub status: u16,
    /// Headers in insertion order; repeated names are all sent.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl FabricResponse {
    /// A `text/plain` response.
    pub fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![(header::CONTENT_TYPE.to_string(), TEXT_PLAIN.to_string())],
            body: body.into(),
        }
    }

    /// A JSON error body: `{"error": message}`.
    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string();
        Self {
            status,
            headers: vec![(
                header::CONTENT_TYPE.to_string(),
                "application/json".to_string(),
            )],
            body: body.into_bytes(),
        }
    }

    /// The response for a failed request that never reached a guest.
    pub fn from_error(err: &FabricError) -> Self {
        Self::error(err.kind().http_status(), &err.to_string())
    }

    /// The response for an execution result.
    ///
    /// Guest output is sent as `text/plain` unless the guest set its own
    /// `Content-Type`; guest headers are appended as set. A guest error
    /// message is sent as the raw body.
    pub fn from_result(result: ExecResult) -> Self {
        let status = result.http_status();
        match result.outcome {
            ExecOutcome::Response(response) => {
                let mut headers: Vec<(String, String)> = response
                    .resp_headers
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect();
                if !response.resp_headers.contains(header::CONTENT_TYPE.as_str()) {
                    headers.insert(0, (header::CONTENT_TYPE.to_string(), TEXT_PLAIN.to_string()));
                }
                Self {
                    status,
                    headers,
                    body: response.output,
                }
            }
            ExecOutcome::RunErr(run) => Self::text(status, run.message),
            ExecOutcome::ExecErr(e) => Self::error(status, &e.message),
        }
    }

    /// Convert to an axum response. Headers that are not valid HTTP are
    /// dropped.
    pub fn into_axum_response(self) -> Response<Body> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "Dropping invalid response header"),
            }
        }
        response
    }
}

impl IntoResponse for FabricResponse {
    fn into_response(self) -> axum::response::Response {
        self.into_axum_response()
    }
}
