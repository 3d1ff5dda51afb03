//! Tenant authorization against the control plane.
//!
//! [`Authorizer::authorize`] checks a bearer credential for a tenant
//! identifier of the form `{environment}.{tenant}`. Successful lookups are
//! cached per `identifier|namespace|name|credential` for the configured TTL
//! (ten minutes by default); concurrent lookups of the same key share one
//! upstream request. Failures are never cached.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use fabric_common::{AuthConfig, Clock, FabricError, SystemClock};

use crate::ttl_cache::TtlCache;

/// What the control plane knows about a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantInfo {
    /// Party the credential was issued to.
    #[serde(default)]
    pub authorized_party: String,
    /// Owning organization.
    #[serde(default)]
    pub organization: String,
    /// Environment the tenant lives in.
    pub environment: String,
    /// Tenant id within the environment.
    pub tenant_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

impl TenantInfo {
    /// The `{environment}.{tenant}` identifier this info describes.
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.environment, self.tenant_id)
    }
}

/// Authorizes dispatch requests against the control plane.
#[derive(Debug)]
pub struct Authorizer {
    client: Client,
    control_plane: String,
    cache: TtlCache<String, TenantInfo>,
}

impl Authorizer {
    /// Build from configuration.
    ///
    /// Fails if no control plane is configured.
    pub fn new(config: &AuthConfig) -> Result<Self, FabricError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build on `clock`.
    pub fn with_clock(config: &AuthConfig, clock: Arc<dyn Clock>) -> Result<Self, FabricError> {
        let control_plane = config
            .control_plane
            .clone()
            .ok_or_else(|| FabricError::invalid_config("auth.control_plane is not set"))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| FabricError::invalid_config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            control_plane: control_plane.trim_end_matches('/').to_string(),
            cache: TtlCache::with_clock("authorizer", config.ttl(), clock),
        })
    }

    /// Check `credential` for `identifier/namespace/name`.
    ///
    /// # Errors
    ///
    /// - `Access` if the credential is empty or the control plane rejects it
    /// - `Forbidden` if the credential belongs to a different tenant
    /// - `Transient` on network failures and unexpected upstream statuses
    /// - `Canceled` if `cancel` fires first
    #[instrument(skip(self, credential, cancel))]
    pub async fn authorize(
        &self,
        credential: &str,
        identifier: &str,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TenantInfo, FabricError> {
        if credential.is_empty() {
            return Err(FabricError::access("empty credential"));
        }

        let key = format!("{identifier}|{namespace}|{name}|{credential}");
        let info = self
            .cache
            .get_or_load(&key, cancel, || self.fetch(credential, identifier))
            .await?;

        if info.identifier() != identifier {
            warn!(identifier, tenant = %info.identifier(), "Credential belongs to another tenant");
            return Err(FabricError::forbidden(format!(
                "credential is not valid for {identifier}"
            )));
        }
        Ok(info)
    }

    async fn fetch(&self, credential: &str, identifier: &str) -> Result<TenantInfo, FabricError> {
        let url = format!("{}/environment/v1/tenant/{identifier}", self.control_plane);
        debug!(%url, "Authorizing with control plane");

        let response = self
            .client
            .get(&url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| FabricError::transient(format!("control plane request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => response
                .json::<TenantInfo>()
                .await
                .map_err(|e| FabricError::transient(format!("malformed tenant info: {e}"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FabricError::access(format!("control plane rejected credential for {identifier}")))
            }
            status => Err(FabricError::transient(format!(
                "control plane returned {status}"
            ))),
        }
    }
}
