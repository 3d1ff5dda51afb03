//! HTTP request conversion into the guest request envelope.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;

use fabric_common::CoordinatedRequest;

/// Header carrying a caller-chosen request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build a [`CoordinatedRequest`] from the parts of an inbound request.
///
/// Repeated headers are joined with `", "`. A non-empty `X-Request-Id`
/// header replaces the generated request id.
pub fn coordinated_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    params: BTreeMap<String, String>,
    body: Bytes,
) -> CoordinatedRequest {
    let url = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    let mut request = CoordinatedRequest::new(method.as_str(), url, body.to_vec());

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        request
            .headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    if let Some(id) = request
        .header(REQUEST_ID_HEADER)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
    {
        request.id = id;
    }
    request.params = params;
    request
}

/// Bearer credential from `Authorization`, or `""` if absent.
pub fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map_or("", str::trim)
}
