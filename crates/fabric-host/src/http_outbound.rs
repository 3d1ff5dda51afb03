//! Outbound HTTP host functions.
//!
//! - `fetch_url(method, url_ptr, url_len, body_ptr, body_len, ident)`
//! - `graphql_query(endpoint_ptr, endpoint_len, query_ptr, query_len, ident)`
//!
//! Both are subject to the [`Permissions`] allow-list, the private address
//! block and the per-call request budget. Requests observe the job's
//! cancellation token and return `Canceled` promptly when it fires.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_common::{FabricError, HostCallError};
use fabric_core::{HostCall, HostRegistry, Returns, complete, reject};

use crate::Permissions;

/// Largest response body handed to a guest.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Separator between the URL and each `key:value` header in `fetch_url`.
const HEADER_SEPARATOR: &str = "::";

/// HTTP outbound host implementation.
///
/// Shared by every call. Provides:
/// - Permission checking against allowed hosts
/// - SSRF protection (blocking private addresses)
/// - Request timeout enforcement
/// - Cancellation
#[derive(Debug, Clone)]
pub struct HttpOutboundHost {
    /// HTTP client (shared, connection pooled).
    client: Client,

    /// Permission configuration.
    permissions: Arc<Permissions>,
}

/// HTTP request from guest code.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Target URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

/// HTTP response to guest code.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Body for a 2xx status, otherwise `"{status}: {body}"` as the error.
    pub fn into_result(self) -> Result<Vec<u8>, HostCallError> {
        if (200..300).contains(&self.status) {
            Ok(self.body)
        } else {
            Err(HostCallError::Capability(format!(
                "{}: {}",
                self.status,
                String::from_utf8_lossy(&self.body)
            )))
        }
    }
}

/// HTTP method enumeration, in guest encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Decode the guest-side `method` argument.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Get),
            1 => Some(Self::Head),
            2 => Some(Self::Options),
            3 => Some(Self::Post),
            4 => Some(Self::Put),
            5 => Some(Self::Patch),
            6 => Some(Self::Delete),
            _ => None,
        }
    }

    /// Convert to reqwest method.
    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Outbound HTTP failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// Denied by the permission set.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Malformed URL or header.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Request timed out.
    #[error("request timed out")]
    Timeout,
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Response body too large.
    #[error("response body exceeds {MAX_BODY_BYTES} bytes")]
    BodyTooLarge,
    /// The job was canceled.
    #[error("canceled")]
    Canceled,
    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<HttpError> for HostCallError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::PermissionDenied(resource) => HostCallError::PermissionDenied { resource },
            HttpError::Invalid(reason) => HostCallError::InvalidArgument { reason },
            HttpError::Canceled => HostCallError::Canceled,
            other => HostCallError::Capability(other.to_string()),
        }
    }
}

impl From<HostCallError> for HttpError {
    fn from(err: HostCallError) -> Self {
        match err {
            HostCallError::PermissionDenied { resource } => HttpError::PermissionDenied(resource),
            HostCallError::InvalidArgument { reason } => HttpError::Invalid(reason),
            HostCallError::Canceled => HttpError::Canceled,
            other => HttpError::Other(other.to_string()),
        }
    }
}

impl HttpOutboundHost {
    /// Create a new HTTP outbound host.
    pub fn new(permissions: Permissions, timeout: Duration) -> Result<Self, FabricError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("fabric/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FabricError::invalid_config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, permissions))
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client, permissions: Permissions) -> Self {
        Self {
            client,
            permissions: Arc::new(permissions),
        }
    }

    /// The permission set requests are checked against.
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Perform an HTTP request.
    ///
    /// # Security
    ///
    /// 1. Verify the target host is in the allowed hosts list
    /// 2. Block requests to private/internal networks (SSRF protection)
    pub async fn fetch(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, HttpError> {
        let url = self.permissions.check_url(&request.url).inspect_err(|e| {
            warn!(url = %request.url, error = %e, "HTTP request blocked");
        })?;

        debug!(method = ?request.method, url = %url, "Executing HTTP request");

        let mut builder = self.client.request(request.method.to_reqwest(), url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let send = async {
            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::Timeout
                } else if e.is_connect() {
                    HttpError::ConnectionFailed(e.to_string())
                } else {
                    HttpError::Other(e.to_string())
                }
            })?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| HttpError::Other(e.to_string()))?;
            if body.len() > MAX_BODY_BYTES {
                return Err(HttpError::BodyTooLarge);
            }
            Ok(HttpResponse {
                status,
                body: body.to_vec(),
            })
        };

        let response = tokio::select! {
            res = send => res?,
            () = cancel.cancelled() => return Err(HttpError::Canceled),
        };

        info!(
            url = %request.url,
            status = response.status,
            body_size = response.body.len(),
            "HTTP request completed"
        );
        Ok(response)
    }

    /// POST a GraphQL query and return the `data` member of the response.
    pub async fn graphql(
        &self,
        endpoint: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, HostCallError> {
        let body = serde_json::to_vec(&serde_json::json!({ "query": query, "variables": {} }))
            .map_err(|e| HostCallError::Capability(e.to_string()))?;
        let response = self
            .fetch(
                HttpRequest {
                    method: HttpMethod::Post,
                    url: endpoint.to_string(),
                    headers: vec![("Content-Type".into(), "application/json".into())],
                    body: Some(body),
                },
                cancel,
            )
            .await?
            .into_result()?;

        let value: serde_json::Value = serde_json::from_slice(&response)
            .map_err(|e| HostCallError::Capability(format!("invalid GraphQL response: {e}")))?;
        if let Some(message) = value
            .get("errors")
            .and_then(serde_json::Value::as_array)
            .and_then(|errors| errors.first())
            .map(|first| {
                first
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .map_or_else(|| first.to_string(), str::to_string)
            })
        {
            return Err(HostCallError::Capability(message));
        }

        let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
        Ok(data.to_string().into_bytes())
    }
}

/// Split a `fetch_url` URL into the URL proper and its `::key:value` headers.
pub fn parse_url_headers(raw: &str) -> Result<(String, Vec<(String, String)>), HttpError> {
    let mut parts = raw.split(HEADER_SEPARATOR);
    let url = parts.next().unwrap_or_default().to_string();
    let headers = parts
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| HttpError::Invalid(format!("malformed header '{part}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((url, headers))
}

/// Register `fetch_url` and `graphql_query`.
pub fn register(registry: &mut HostRegistry, host: Arc<HttpOutboundHost>) {
    let fetch = Arc::clone(&host);
    registry.register("fetch_url", 6, Returns::Value, move |call| {
        fetch_url(Arc::clone(&fetch), call)
    });
    registry.register("graphql_query", 5, Returns::Value, move |call| {
        graphql_query(Arc::clone(&host), call)
    });
}

fn fetch_url(host: Arc<HttpOutboundHost>, mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("fetch_url", ident, &e),
        };
        let (method, url_ptr, url_len, body_ptr, body_len) =
            (call.arg(0), call.arg(1), call.arg(2), call.arg(3), call.arg(4));

        let (count, cancel) = {
            let mut guard = ctx.lock();
            (guard.count_outbound_request(), guard.cancel_token().clone())
        };

        let request = host
            .permissions()
            .check_budget(count)
            .and_then(|()| read_request(&mut call, method, (url_ptr, url_len), (body_ptr, body_len)));

        let result = match request {
            Ok(request) => match host.fetch(request, &cancel).await {
                Ok(response) => response.into_result(),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        complete(&ctx, result)
    })
}

fn read_request(
    call: &mut HostCall<'_>,
    method: i32,
    (url_ptr, url_len): (i32, i32),
    (body_ptr, body_len): (i32, i32),
) -> Result<HttpRequest, HostCallError> {
    let method = HttpMethod::from_i32(method)
        .ok_or_else(|| HostCallError::invalid_argument(format!("unknown HTTP method {method}")))?;
    let (url, headers) = parse_url_headers(&call.read_string(url_ptr, url_len)?)?;
    let body = if body_len > 0 {
        Some(call.read_memory(body_ptr, body_len)?)
    } else {
        None
    };
    Ok(HttpRequest {
        method,
        url,
        headers,
        body,
    })
}

fn graphql_query(host: Arc<HttpOutboundHost>, mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("graphql_query", ident, &e),
        };
        let (endpoint_ptr, endpoint_len, query_ptr, query_len) =
            (call.arg(0), call.arg(1), call.arg(2), call.arg(3));

        let (count, cancel) = {
            let mut guard = ctx.lock();
            (guard.count_outbound_request(), guard.cancel_token().clone())
        };

        let args = host.permissions().check_budget(count).and_then(|()| {
            let endpoint = call.read_string(endpoint_ptr, endpoint_len)?;
            let query = call.read_string(query_ptr, query_len)?;
            Ok((endpoint, query))
        });
        let result = match args {
            Ok((endpoint, query)) => host.graphql(&endpoint, &query, &cancel).await,
            Err(e) => Err(e),
        };
        complete(&ctx, result)
    })
}
