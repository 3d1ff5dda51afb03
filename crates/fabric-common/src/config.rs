//! Configuration structures for the fabric.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs, fuel)
//! - [`ExecutionConfig`]: Per-call execution limits (fuel, memory, timeout)
//! - [`PoolConfig`]: Instance pool sizing and deadlines
//! - [`SourceConfig`]: Where module bytes come from and how long they are cached
//! - [`AuthConfig`]: Authorizer settings
//! - [`CapabilitiesConfig`]: What host capabilities guests may use

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Module source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Authorizer configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Host capability configuration.
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including memory allocation strategy and interruption.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for fast instance creation.
    ///
    /// Reserves virtual memory for `max_instances` slots up front; disable
    /// on hosts with strict overcommit limits.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances across every pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// Required for per-call deadlines to interrupt a spinning guest.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch increments in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Enable fuel metering.
    ///
    /// When enabled, CPU usage is limited by [`ExecutionConfig::max_fuel`].
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Per-call execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel per call.
    ///
    /// A typical simple function consumes ~1,000-10,000 fuel.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Per-call deadline in milliseconds.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum linear memory per instance in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
            max_memory_mb: defaults::max_memory_mb(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Maximum linear memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }
}

/// Instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum number of instances per module (idle plus in flight).
    #[serde(default = "defaults::pool_capacity")]
    pub capacity: usize,

    /// Instances created up front when a pool is built.
    #[serde(default = "defaults::pool_prewarm")]
    pub prewarm: usize,

    /// How long `acquire` waits for an idle instance.
    #[serde(default = "defaults::acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// How long shutdown waits for in-flight instances to come back.
    #[serde(default = "defaults::shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::pool_capacity(),
            prewarm: defaults::pool_prewarm(),
            acquire_timeout_ms: defaults::acquire_timeout_ms(),
            shutdown_timeout_ms: defaults::shutdown_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Get the acquire deadline as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Get the shutdown deadline as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Which module source backs the fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Modules laid out under a local directory.
    #[default]
    Local,
    /// The remote source-of-truth service.
    Http,
}

/// Module source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Source implementation.
    #[serde(default)]
    pub kind: SourceKind,

    /// Base URL of the source service (`kind = "http"`).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Root of the module tree (`kind = "local"`).
    #[serde(default = "defaults::module_dir")]
    pub module_dir: PathBuf,

    /// TTL for cached module bytes, in seconds.
    #[serde(default = "defaults::bytes_ttl_secs")]
    pub bytes_ttl_secs: u64,

    /// TTL for cached latest refs, in seconds.
    #[serde(default = "defaults::ref_ttl_secs")]
    pub ref_ttl_secs: u64,

    /// Timeout for requests to the source service, in milliseconds.
    #[serde(default = "defaults::upstream_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            endpoint: None,
            module_dir: defaults::module_dir(),
            bytes_ttl_secs: defaults::bytes_ttl_secs(),
            ref_ttl_secs: defaults::ref_ttl_secs(),
            request_timeout_ms: defaults::upstream_timeout_ms(),
        }
    }
}

impl SourceConfig {
    /// Get the module bytes TTL as a `Duration`.
    pub fn bytes_ttl(&self) -> Duration {
        Duration::from_secs(self.bytes_ttl_secs)
    }

    /// Get the latest-ref TTL as a `Duration`.
    pub fn ref_ttl(&self) -> Duration {
        Duration::from_secs(self.ref_ttl_secs)
    }
}

/// Authorizer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Require a bearer credential on dispatch routes.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the control plane.
    #[serde(default)]
    pub control_plane: Option<String>,

    /// How long a successful authorization is cached, in seconds.
    #[serde(default = "defaults::auth_ttl_secs")]
    pub ttl_secs: u64,

    /// Timeout for requests to the control plane, in milliseconds.
    #[serde(default = "defaults::upstream_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            control_plane: None,
            ttl_secs: defaults::auth_ttl_secs(),
            request_timeout_ms: defaults::upstream_timeout_ms(),
        }
    }
}

impl AuthConfig {
    /// Get the cache TTL as a `Duration`.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Check if the authorizer is properly configured.
    ///
    /// Returns `true` if enabled and a control plane is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.control_plane.is_some()
    }
}

/// Host capability configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CapabilitiesConfig {
    /// Outbound HTTP (`fetch_url`, `graphql_query`).
    #[serde(default)]
    pub http: HttpCapabilityConfig,

    /// Tenant-scoped key/value cache.
    #[serde(default)]
    pub cache: CacheCapabilityConfig,

    /// Secrets resolution.
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Directory served by `get_static_file`; disabled when unset.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,

    /// Database queries; disabled when unset.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpCapabilityConfig {
    /// Allowed host patterns (`api.example.com`, `*.example.com`, `*`).
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Permit requests to loopback and private addresses.
    #[serde(default)]
    pub allow_private_addresses: bool,

    /// Maximum outbound requests per call.
    #[serde(default = "defaults::max_requests_per_call")]
    pub max_requests_per_call: u32,

    /// Timeout for each outbound request, in milliseconds.
    #[serde(default = "defaults::upstream_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HttpCapabilityConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            allow_private_addresses: false,
            max_requests_per_call: defaults::max_requests_per_call(),
            timeout_ms: defaults::upstream_timeout_ms(),
        }
    }
}

impl HttpCapabilityConfig {
    /// Get the request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Cache capability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheCapabilityConfig {
    /// Maximum number of entries across every tenant.
    #[serde(default = "defaults::cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheCapabilityConfig {
    fn default() -> Self {
        Self {
            max_entries: defaults::cache_max_entries(),
        }
    }
}

/// Secrets resolution settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// Names guests may resolve. Anything else is denied.
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Inline values, consulted before the process environment.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Database capability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database file, or `:memory:`.
    pub path: String,

    /// Queries guests may run by name.
    #[serde(default)]
    pub queries: Vec<NamedQuery>,
}

/// Kind of a named query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// `INSERT` statement.
    Insert,
    /// `UPDATE` statement.
    Update,
    /// `DELETE` statement.
    Delete,
    /// `SELECT` statement.
    Select,
}

impl QueryType {
    /// Decode the guest-side `query_type` argument of `db_exec`.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            3 => Some(Self::Select),
            _ => None,
        }
    }
}

/// A query declared in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamedQuery {
    /// Name guests refer to.
    pub name: String,

    /// Statement kind.
    #[serde(rename = "type")]
    pub query_type: QueryType,

    /// SQL with `?` positional parameters.
    pub query: String,
}

/// Default value functions for serde.
mod defaults {
    use std::path::PathBuf;

    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        10
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn timeout_ms() -> u64 {
        10_000
    }

    pub const fn max_memory_mb() -> u32 {
        64
    }

    pub const fn pool_capacity() -> usize {
        64
    }

    pub const fn pool_prewarm() -> usize {
        8
    }

    pub const fn acquire_timeout_ms() -> u64 {
        5_000
    }

    pub const fn shutdown_timeout_ms() -> u64 {
        5_000
    }

    pub fn module_dir() -> PathBuf {
        PathBuf::from("./modules")
    }

    pub const fn bytes_ttl_secs() -> u64 {
        168 * 60 * 60
    }

    pub const fn ref_ttl_secs() -> u64 {
        60
    }

    pub const fn upstream_timeout_ms() -> u64 {
        10_000
    }

    pub const fn auth_ttl_secs() -> u64 {
        10 * 60
    }

    pub const fn max_requests_per_call() -> u32 {
        10
    }

    pub const fn cache_max_entries() -> usize {
        10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert!(config.engine.epoch_interruption);
        assert!(!config.engine.fuel_metering);

        assert_eq!(config.execution.timeout_ms, 10_000);
        assert_eq!(config.pool.capacity, 64);
        assert_eq!(config.pool.prewarm, 8);
        assert_eq!(config.source.kind, SourceKind::Local);
        assert_eq!(config.source.bytes_ttl(), Duration::from_secs(604_800));
        assert_eq!(config.source.ref_ttl(), Duration::from_secs(60));
        assert_eq!(config.auth.ttl(), Duration::from_secs(600));
        assert!(!config.auth.enabled);
        assert!(config.capabilities.http.allowed_hosts.is_empty());
        assert!(config.capabilities.database.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.pool.capacity, config.pool.capacity);
        assert_eq!(deserialized.execution.max_fuel, config.execution.max_fuel);
    }

    #[test]
    fn test_durations() {
        let config = ExecutionConfig {
            timeout_ms: 500,
            max_memory_mb: 2,
            ..Default::default()
        };
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.max_memory_bytes(), 2 * 1024 * 1024);

        let engine = EngineConfig {
            epoch_tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(engine.epoch_tick(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"pool": {"capacity": 4}, "source": {"kind": "http", "endpoint": "http://src"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.pool.capacity, 4);
        assert_eq!(config.pool.prewarm, 8);
        assert_eq!(config.source.kind, SourceKind::Http);
        assert_eq!(config.source.endpoint.as_deref(), Some("http://src"));
    }

    #[test]
    fn test_auth_is_configured() {
        let mut auth = AuthConfig::default();
        assert!(!auth.is_configured());

        auth.enabled = true;
        assert!(!auth.is_configured());

        auth.control_plane = Some("http://cp".into());
        assert!(auth.is_configured());
    }

    #[test]
    fn test_query_type() {
        assert_eq!(QueryType::from_i32(0), Some(QueryType::Insert));
        assert_eq!(QueryType::from_i32(3), Some(QueryType::Select));
        assert_eq!(QueryType::from_i32(9), None);

        let query: NamedQuery =
            serde_json::from_str(r#"{"name":"users","type":"select","query":"SELECT 1"}"#).unwrap();
        assert_eq!(query.query_type, QueryType::Select);
    }
}
