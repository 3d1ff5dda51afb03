//! Module sourcing and tenant authorization.
//!
//! - [`ModuleSource`]: where module bytes and refs come from, with
//!   [`HttpSource`] for the source service and [`LocalSource`] for a
//!   directory tree
//! - [`ModuleCache`]: read-through caches for bytes and latest refs
//! - [`Authorizer`]: credential checks against the control plane
//! - [`TtlCache`]: the coalescing TTL cache underneath both

pub mod authorizer;
pub mod http_source;
pub mod local_source;
pub mod module_cache;
pub mod source;
pub mod ttl_cache;

use std::sync::Arc;

use fabric_common::{FabricError, SourceConfig, SourceKind};

pub use authorizer::{Authorizer, TenantInfo};
pub use http_source::HttpSource;
pub use local_source::LocalSource;
pub use module_cache::ModuleCache;
pub use source::{ModuleEntry, ModuleSource, Overview, TenantConfig};
pub use ttl_cache::TtlCache;

/// Build the source `config` describes.
pub fn source_from_config(config: &SourceConfig) -> Result<Arc<dyn ModuleSource>, FabricError> {
    match config.kind {
        SourceKind::Local => Ok(Arc::new(LocalSource::new(config.module_dir.clone()))),
        SourceKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| FabricError::invalid_config("source.endpoint is not set"))?;
            Ok(Arc::new(HttpSource::new(
                endpoint,
                std::time::Duration::from_millis(config.request_timeout_ms),
            )?))
        }
    }
}
