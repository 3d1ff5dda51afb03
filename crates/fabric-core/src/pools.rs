//! Map from canonical FQMN to the pool of that module.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{info, instrument};
use wasmtime::Linker;

use fabric_common::{ExecutionConfig, FabricError, PoolConfig};

use crate::WasmEngine;
use crate::ident::IdentifierRegistry;
use crate::module::{CompiledModule, ModuleRef};
use crate::pool::{InstanceFactory, InstancePool, PoolStats};
use crate::store::InstanceState;

type Slot = Arc<OnceCell<Arc<InstancePool>>>;

/// Every instance pool of the process, keyed by canonical FQMN.
///
/// Concurrent requests for the same key share one construction: the module is
/// compiled once and every caller receives the same pool. A failed
/// construction is not remembered, so the next request retries.
pub struct PoolSet {
    engine: WasmEngine,
    linker: Arc<Linker<InstanceState>>,
    idents: Arc<IdentifierRegistry>,
    execution: ExecutionConfig,
    pool_config: PoolConfig,
    pools: DashMap<String, Slot>,
}

impl PoolSet {
    /// Create an empty pool set.
    pub fn new(
        engine: WasmEngine,
        linker: Linker<InstanceState>,
        idents: Arc<IdentifierRegistry>,
        execution: ExecutionConfig,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            engine,
            linker: Arc::new(linker),
            idents,
            execution,
            pool_config,
            pools: DashMap::new(),
        }
    }

    /// The shared engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// The identifier registry every instance resolves against.
    pub fn idents(&self) -> &Arc<IdentifierRegistry> {
        &self.idents
    }

    /// Pool configuration applied to new pools.
    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    /// Existing pool for `key`, if constructed.
    pub fn get(&self, key: &str) -> Option<Arc<InstancePool>> {
        self.pools.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Return the pool for `key`, compiling `module` and building the pool on
    /// first use.
    #[instrument(skip(self, module), fields(module_ref = %module.module_ref()))]
    pub async fn get_or_create(
        &self,
        key: &str,
        module: &ModuleRef,
    ) -> Result<Arc<InstancePool>, FabricError> {
        let slot: Slot = Arc::clone(
            self.pools
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        match slot.get_or_try_init(|| self.build(key, module.clone())).await {
            Ok(pool) => Ok(Arc::clone(pool)),
            Err(e) => {
                self.pools
                    .remove_if(key, |_, s| Arc::ptr_eq(s, &slot) && !s.initialized());
                Err(e)
            }
        }
    }

    async fn build(&self, key: &str, module: ModuleRef) -> Result<Arc<InstancePool>, FabricError> {
        let engine = self.engine.inner().clone();
        let compiled = tokio::task::spawn_blocking(move || CompiledModule::compile(&engine, &module))
            .await
            .map_err(|e| FabricError::invariant(format!("compilation task failed: {e}")))??;

        let factory = InstanceFactory::new(
            self.engine.clone(),
            compiled,
            Arc::clone(&self.linker),
            Arc::clone(&self.idents),
            self.execution.clone(),
        );
        InstancePool::new(key, factory, &self.pool_config).await
    }

    /// Number of pools, counting those still under construction.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns `true` if no pool exists or is being built.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Counters of every constructed pool.
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.pools
            .iter()
            .filter_map(|entry| entry.get().map(|pool| (entry.key().clone(), pool.stats())))
            .collect()
    }

    /// Tear down and forget the pool for `key`.
    pub async fn remove(&self, key: &str) -> Option<usize> {
        let (_, slot) = self.pools.remove(key)?;
        let pool = slot.get()?;
        Some(pool.shutdown(self.pool_config.shutdown_timeout()).await)
    }

    /// Shut every pool down, each within `deadline`.
    ///
    /// Returns the total number of instances still live afterwards.
    pub async fn shutdown(&self, deadline: Duration) -> usize {
        let pools: Vec<Arc<InstancePool>> = self
            .pools
            .iter()
            .filter_map(|entry| entry.get().cloned())
            .collect();
        self.pools.clear();

        let residual = futures::future::join_all(pools.iter().map(|p| p.shutdown(deadline)))
            .await
            .into_iter()
            .sum();
        info!(pools = pools.len(), residual, "All pools shut down");
        residual
    }
}

impl std::fmt::Debug for PoolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSet")
            .field("pools", &self.len())
            .finish_non_exhaustive()
    }
}
