//! Registration of every host function into a [`HostRegistry`].

use std::sync::Arc;

use tracing::info;

use fabric_common::{CapabilitiesConfig, FabricError};
use fabric_core::HostRegistry;

use crate::cache::GuestCache;
use crate::database::Database;
use crate::http_outbound::HttpOutboundHost;
use crate::permissions::Permissions;
use crate::secrets::Secrets;
use crate::static_files::StaticFiles;
use crate::{cache, database, ffi, http_outbound, logging, request, secrets, static_files};

/// Shared state behind the capability host functions.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Outbound HTTP client and permissions.
    pub http: Arc<HttpOutboundHost>,
    /// Tenant-scoped cache.
    pub cache: Arc<GuestCache>,
    /// Allow-listed secrets.
    pub secrets: Arc<Secrets>,
    /// Static file directory, if configured.
    pub static_files: Option<StaticFiles>,
    /// Named queries, if configured.
    pub database: Option<Database>,
}

impl Capabilities {
    /// Build every capability from configuration.
    pub fn from_config(config: &CapabilitiesConfig) -> Result<Self, FabricError> {
        let http = HttpOutboundHost::new(Permissions::from_config(&config.http), config.http.timeout())?;
        let database = config.database.as_ref().map(Database::open).transpose()?;

        Ok(Self {
            http: Arc::new(http),
            cache: Arc::new(GuestCache::new(config.cache.max_entries)),
            secrets: Arc::new(Secrets::from_config(&config.secrets)),
            static_files: config.static_dir.clone().map(StaticFiles::new),
            database,
        })
    }

    /// Capabilities with permissive HTTP and nothing else configured.
    ///
    /// Intended for tests and local development.
    pub fn permissive() -> Result<Self, FabricError> {
        let mut this = Self::from_config(&CapabilitiesConfig::default())?;
        this.http = Arc::new(HttpOutboundHost::new(
            Permissions::all(),
            fabric_common::HttpCapabilityConfig::default().timeout(),
        )?);
        Ok(this)
    }
}

/// Register the full host API on `registry`.
///
/// Registers, each also under its `_swift` variant when linked:
/// `return_result`, `return_error`, `return_abort`, `get_ffi_result`,
/// `add_ffi_var`, `log_msg`, `fetch_url`, `graphql_query`,
/// `request_get_field`, `request_set_field`, `resp_set_header`,
/// `cache_set`, `cache_get`, `db_exec`, `get_static_file` and
/// `get_secret_value`.
pub fn register_all(registry: &mut HostRegistry, capabilities: &Capabilities) {
    ffi::register(registry);
    logging::register(registry);
    request::register(registry);
    http_outbound::register(registry, Arc::clone(&capabilities.http));
    cache::register(registry, Arc::clone(&capabilities.cache));
    database::register(registry, capabilities.database.clone());
    static_files::register(registry, capabilities.static_files.clone());
    secrets::register(registry, Arc::clone(&capabilities.secrets));

    info!(host_fns = registry.len(), "Host API registered");
}

/// A registry holding the full host API.
pub fn host_registry(capabilities: &Capabilities) -> HostRegistry {
    let mut registry = HostRegistry::new();
    register_all(&mut registry, capabilities);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::Returns;

    const CANONICAL: &[(&str, usize, Returns)] = &[
        ("return_result", 3, Returns::Void),
        ("return_error", 4, Returns::Void),
        ("get_ffi_result", 2, Returns::Value),
        ("add_ffi_var", 5, Returns::Value),
        ("fetch_url", 6, Returns::Value),
        ("log_msg", 4, Returns::Void),
        ("request_get_field", 4, Returns::Value),
        ("request_set_field", 6, Returns::Value),
        ("resp_set_header", 5, Returns::Void),
        ("cache_set", 6, Returns::Value),
        ("cache_get", 3, Returns::Value),
        ("db_exec", 4, Returns::Value),
        ("get_static_file", 3, Returns::Value),
        ("get_secret_value", 3, Returns::Value),
        ("graphql_query", 5, Returns::Value),
        ("return_abort", 7, Returns::Void),
    ];

    #[test]
    fn test_register_all_matches_host_api() {
        let registry = host_registry(&Capabilities::permissive().unwrap());

        assert_eq!(registry.len(), CANONICAL.len());
        for (name, arity, returns) in CANONICAL {
            let f = registry
                .get(name)
                .unwrap_or_else(|| panic!("{name} not registered"));
            assert_eq!(f.arity(), *arity, "{name}");
            assert_eq!(f.returns(), *returns, "{name}");
        }
    }

    #[test]
    fn test_linker_builds() {
        let engine = fabric_core::WasmEngine::new(&fabric_common::EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        let registry = host_registry(&Capabilities::permissive().unwrap());
        assert!(registry.build_linker(&engine).is_ok());
    }
}
