//! [`ModuleSource`] backed by the remote source service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use fabric_common::{FabricError, Fqmn};

use crate::source::{ModuleEnvelope, ModuleSource, Overview, TenantConfig};

/// Client for the source service's `/system/v1` API.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    endpoint: String,
}

impl HttpSource {
    /// Create a client for the service at `endpoint`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FabricError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FabricError::invalid_config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Use an existing client.
    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    /// The service base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T, FabricError> {
        let url = format!("{}/system/v1{path}", self.endpoint);
        debug!(%url, "Source request");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FabricError::transient(format!("source request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => response
                .json::<T>()
                .await
                .map_err(|e| FabricError::transient(format!("malformed {what} from source: {e}"))),
            StatusCode::NOT_FOUND => Err(FabricError::not_found(what.to_string())),
            status => Err(FabricError::transient(format!(
                "source returned {status} for {what}"
            ))),
        }
    }
}

#[async_trait]
impl ModuleSource for HttpSource {
    async fn overview(&self) -> Result<Overview, FabricError> {
        self.get_json("/overview", "overview").await
    }

    #[instrument(skip(self))]
    async fn tenant(&self, identifier: &str) -> Result<TenantConfig, FabricError> {
        self.get_json(&format!("/tenant/{identifier}"), &format!("tenant {identifier}"))
            .await
    }

    #[instrument(skip(self), fields(fqmn = %fqmn))]
    async fn module(&self, fqmn: &Fqmn) -> Result<Vec<u8>, FabricError> {
        let envelope: ModuleEnvelope = self
            .get_json(&format!("/module{}", fqmn.url_path()), &format!("module {fqmn}"))
            .await?;
        Ok(envelope.wasm_ref.data)
    }
}
