//! Outbound network permissions for guest modules.
//!
//! [`Permissions`] decides which URLs `fetch_url` and `graphql_query` may
//! reach and how many outbound requests one call may make.

use std::collections::HashSet;

use fabric_common::{HostCallError, HttpCapabilityConfig};

/// Outbound HTTP permission set, shared by every call.
///
/// # Security Philosophy
///
/// - By default, nothing is allowed
/// - Each host must be explicitly granted
/// - Loopback, private and link-local targets are blocked unless
///   `allow_private_addresses` is set
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    /// Allowed HTTP hosts (domain patterns).
    ///
    /// Patterns can be:
    /// - Exact match: `api.example.com`
    /// - Wildcard subdomain: `*.example.com` (matches `api.example.com`, `www.example.com`)
    /// - All hosts: `*`
    pub allowed_http_hosts: HashSet<String>,

    /// Permit loopback and private targets.
    pub allow_private_addresses: bool,

    /// Maximum outbound requests per call.
    pub max_http_requests: u32,
}

impl Permissions {
    /// Create a permission set that allows nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a permission set that allows every host, private ones included.
    ///
    /// Intended for tests and local development.
    pub fn all() -> Self {
        Self {
            allowed_http_hosts: HashSet::from(["*".to_string()]),
            allow_private_addresses: true,
            max_http_requests: 100,
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &HttpCapabilityConfig) -> Self {
        Self {
            allowed_http_hosts: config.allowed_hosts.iter().cloned().collect(),
            allow_private_addresses: config.allow_private_addresses,
            max_http_requests: config.max_requests_per_call,
        }
    }

    /// Create a builder for constructing permissions.
    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::default()
    }

    /// Check `url` against the allow-list and the private address block.
    pub fn check_url(&self, url: &str) -> Result<url::Url, HostCallError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| HostCallError::invalid_argument(format!("invalid URL '{url}': {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HostCallError::invalid_argument(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .map(str::to_lowercase)
            .ok_or_else(|| HostCallError::invalid_argument(format!("URL '{url}' has no host")))?;

        let allowed = self.allowed_http_hosts.contains("*")
            || self
                .allowed_http_hosts
                .iter()
                .any(|pattern| Self::matches_pattern(pattern, &host));
        if !allowed {
            return Err(HostCallError::PermissionDenied {
                resource: format!("HTTP access to {host}"),
            });
        }

        if !self.allow_private_addresses && Self::is_private_address(&parsed) {
            return Err(HostCallError::PermissionDenied {
                resource: format!("private address {host}"),
            });
        }

        Ok(parsed)
    }

    /// Check the per-call budget given the number of requests made so far,
    /// this one included.
    pub fn check_budget(&self, count: u32) -> Result<(), HostCallError> {
        if count > self.max_http_requests {
            return Err(HostCallError::PermissionDenied {
                resource: format!(
                    "more than {} outbound requests per call",
                    self.max_http_requests
                ),
            });
        }
        Ok(())
    }

    /// Check if a host matches a permission pattern.
    fn matches_pattern(pattern: &str, host: &str) -> bool {
        let pattern = pattern.to_lowercase();

        if let Some(domain) = pattern.strip_prefix("*.") {
            host == domain || host.ends_with(&format!(".{domain}"))
        } else {
            pattern == host
        }
    }

    /// Check if the given URL targets a private/internal address.
    ///
    /// Blocks:
    /// - localhost and 127.0.0.0/8
    /// - Private IP ranges (10.x.x.x, 172.16-31.x.x, 192.168.x.x)
    /// - Link-local addresses (169.254.x.x), cloud metadata endpoints included
    pub fn is_private_address(url: &url::Url) -> bool {
        match url.host() {
            Some(url::Host::Domain(domain)) => {
                let domain = domain.to_lowercase();
                domain == "localhost"
                    || domain.ends_with(".localhost")
                    || domain == "metadata.google.internal"
            }
            Some(url::Host::Ipv4(v4)) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.is_unspecified()
            }
            Some(url::Host::Ipv6(v6)) => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.to_ipv4_mapped().is_some_and(|v4| {
                        v4.is_private() || v4.is_loopback() || v4.is_link_local()
                    })
            }
            None => false,
        }
    }
}

/// Builder for [`Permissions`].
#[derive(Debug, Default)]
pub struct PermissionsBuilder {
    inner: Permissions,
}

impl PermissionsBuilder {
    /// Allow HTTP access to specific hosts.
    #[must_use]
    pub fn allow_http_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.allowed_http_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Permit loopback and private targets.
    #[must_use]
    pub fn allow_private_addresses(mut self) -> Self {
        self.inner.allow_private_addresses = true;
        self
    }

    /// Set the maximum number of HTTP requests per call.
    #[must_use]
    pub fn max_http_requests(mut self, max: u32) -> Self {
        self.inner.max_http_requests = max;
        self
    }

    /// Build the permissions.
    #[must_use]
    pub fn build(self) -> Permissions {
        self.inner
    }
}
