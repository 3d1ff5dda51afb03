//! Read-through caches in front of a [`ModuleSource`].
//!
//! - Module bytes, keyed by the FQMN URL path. Bytes are immutable per ref,
//!   so the TTL is long (a week by default).
//! - Latest refs, keyed by module name, with a short TTL so "by name"
//!   dispatch does not hit the source on every call.
//!
//! Fetched bytes are hashed and must match the ref they were requested
//! under; a mismatch is an `Invariant` error and nothing is cached.
//! Upstream failures, `NotFound` included, are never cached.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fabric_common::{Clock, FabricError, Fqmn, ModuleName, SourceConfig, SystemClock};
use fabric_core::ModuleRef;

use crate::source::ModuleSource;
use crate::ttl_cache::TtlCache;

/// Module bytes and latest-ref caches over one source.
#[derive(Debug)]
pub struct ModuleCache {
    source: Arc<dyn ModuleSource>,
    bytes: TtlCache<String, ModuleRef>,
    refs: TtlCache<ModuleName, String>,
    by_ref: RwLock<HashMap<String, Fqmn>>,
}

impl ModuleCache {
    /// Cache `source` with the TTLs in `config`.
    pub fn new(source: Arc<dyn ModuleSource>, config: &SourceConfig) -> Self {
        Self::with_clock(source, config, Arc::new(SystemClock))
    }

    /// Cache `source` on `clock`.
    pub fn with_clock(
        source: Arc<dyn ModuleSource>,
        config: &SourceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            bytes: TtlCache::with_clock("module_bytes", config.bytes_ttl(), Arc::clone(&clock)),
            refs: TtlCache::with_clock("latest_ref", config.ref_ttl(), clock),
            by_ref: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying source.
    pub fn source(&self) -> &Arc<dyn ModuleSource> {
        &self.source
    }

    /// Resolve `module` to its current revision.
    pub async fn resolve(
        &self,
        module: &ModuleName,
        cancel: &CancellationToken,
    ) -> Result<Fqmn, FabricError> {
        let module_ref = self
            .refs
            .get_or_load(module, cancel, || self.source.latest_ref(module))
            .await?;
        let fqmn = module.with_ref(module_ref)?;
        self.remember(&fqmn);
        Ok(fqmn)
    }

    /// Find the module whose ref is `module_ref`.
    pub async fn find_ref(&self, module_ref: &str) -> Result<Fqmn, FabricError> {
        if let Some(fqmn) = self.by_ref.read().get(module_ref) {
            return Ok(fqmn.clone());
        }
        let fqmn = self.source.find_ref(module_ref).await?;
        self.remember(&fqmn);
        Ok(fqmn)
    }

    /// The verified bytes of `fqmn`.
    pub async fn fetch(
        &self,
        fqmn: &Fqmn,
        cancel: &CancellationToken,
    ) -> Result<ModuleRef, FabricError> {
        let result = self
            .bytes
            .get_or_load(&fqmn.url_path(), cancel, || async {
                let bytes = self.source.module(fqmn).await?;
                let module = ModuleRef::verified(fqmn.to_string(), bytes, &fqmn.module_ref)?;
                info!(fqmn = %fqmn, len = module.bytes().len(), "Module fetched");
                Ok(module)
            })
            .await;

        if let Err(FabricError::Invariant { reason }) = &result {
            warn!(fqmn = %fqmn, %reason, "Fetched bytes do not match ref");
            self.refs.invalidate(&fqmn.module_name());
        }
        result
    }

    /// Number of cached module byte entries.
    pub fn cached_modules(&self) -> usize {
        self.bytes.len()
    }

    fn remember(&self, fqmn: &Fqmn) {
        self.by_ref
            .write()
            .insert(fqmn.module_ref.clone(), fqmn.clone());
    }
}
