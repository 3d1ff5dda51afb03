//! [`Executor`] that forwards jobs to a peer's `POST /exec`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use fabric_common::{ErrorKind, ExecRequest, ExecResult, FabricError};

use crate::executor::Executor;

/// Runs jobs on another fabric node.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    client: Client,
    endpoint: String,
}

impl RemoteExecutor {
    /// Forward to the node at `endpoint`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FabricError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FabricError::invalid_config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, job: &ExecRequest) -> Result<ExecResult, String> {
        let response = self
            .client
            .post(format!("{}/exec", self.endpoint))
            .json(job)
            .send()
            .await
            .map_err(|e| format!("exec request failed: {e}"))?;

        // Failed jobs come back as ExecResults with a non-2xx status.
        let status = response.status();
        response
            .json::<ExecResult>()
            .await
            .map_err(|e| format!("peer returned {status} without an exec result: {e}"))
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    #[instrument(skip_all, fields(target = %job.target, endpoint = %self.endpoint))]
    async fn exec(&self, job: ExecRequest, cancel: CancellationToken) -> ExecResult {
        let target = job.target.to_string();
        let result = tokio::select! {
            () = cancel.cancelled() => {
                return ExecResult::exec_err(target, ErrorKind::Canceled, "remote exec canceled");
            }
            result = self.post(&job) => result,
        };

        result.unwrap_or_else(|message| {
            debug!(%message, "Remote exec failed");
            ExecResult::exec_err(target, ErrorKind::Transient, message)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_common::{CoordinatedRequest, ExecTarget, ResponseHeaders, RunError};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job() -> ExecRequest {
        ExecRequest::new(
            ExecTarget::Ref {
                module_ref: "abc".into(),
            },
            CoordinatedRequest::new("POST", "/ref/abc", b"hi".to_vec()),
        )
    }

    #[tokio::test]
    async fn test_result_round_trips() {
        let server = MockServer::start().await;
        let expected = ExecResult::response("fqmn://t/ns/echo@abc", b"hi".to_vec(), ResponseHeaders::new());
        Mock::given(method("POST"))
            .and(path("/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&expected))
            .expect(1)
            .mount(&server)
            .await;

        let remote = RemoteExecutor::new(server.uri(), Duration::from_secs(5)).unwrap();
        let result = remote.exec(job(), CancellationToken::new()).await;
        assert_eq!(result, expected);
    }

    #[tokio::test]
    async fn test_error_results_pass_through() {
        let server = MockServer::start().await;
        let expected = ExecResult::run_err("f", RunError::new(418, "teapot"));
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(418).set_body_json(&expected))
            .mount(&server)
            .await;

        let remote = RemoteExecutor::new(server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(remote.exec(job(), CancellationToken::new()).await, expected);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let remote = RemoteExecutor::new(server.uri(), Duration::from_secs(5)).unwrap();
        let result = remote.exec(job(), CancellationToken::new()).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Transient));
    }
}
