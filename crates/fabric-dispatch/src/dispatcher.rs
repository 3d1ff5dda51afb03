//! In-process job execution.
//!
//! A job names its module by `(tenant, namespace, name)`, by ref, or by full
//! FQMN. The dispatcher resolves it to a revision, finds or builds the pool
//! for that revision, runs one call on a pooled instance and folds the
//! outcome into an [`ExecResult`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fabric_common::{ExecRequest, ExecResult, ExecTarget, FabricError, Fqmn, ModuleName};
use fabric_core::{InstancePool, PoolSet};
use fabric_source::ModuleCache;

use crate::executor::Executor;

/// Default per-job deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs jobs on the local pools.
#[derive(Debug)]
pub struct Dispatcher {
    pools: Arc<PoolSet>,
    modules: Arc<ModuleCache>,
    default_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over `pools`, fetching modules through `modules`.
    pub fn new(pools: Arc<PoolSet>, modules: Arc<ModuleCache>) -> Self {
        Self {
            pools,
            modules,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use `timeout` for jobs that do not carry their own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The pools jobs run on.
    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    /// The module caches.
    pub fn modules(&self) -> &Arc<ModuleCache> {
        &self.modules
    }

    /// Resolve `target` to a module revision.
    pub async fn resolve(
        &self,
        target: &ExecTarget,
        cancel: &CancellationToken,
    ) -> Result<Fqmn, FabricError> {
        match target {
            ExecTarget::Name {
                tenant,
                namespace,
                name,
            } => {
                let module = ModuleName::new(tenant.as_str(), namespace.as_str(), name.as_str())?;
                self.modules.resolve(&module, cancel).await
            }
            ExecTarget::Ref { module_ref } => self.modules.find_ref(module_ref).await,
            ExecTarget::Fqmn { fqmn } => Ok(fqmn.clone()),
        }
    }

    /// The pool for `fqmn`, fetching and compiling the module on first use.
    pub async fn pool_for(
        &self,
        fqmn: &Fqmn,
        cancel: &CancellationToken,
    ) -> Result<Arc<InstancePool>, FabricError> {
        let key = fqmn.to_string();
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool);
        }
        let module = self.modules.fetch(fqmn, cancel).await?;
        self.pools.get_or_create(&key, &module).await
    }

    /// Run `job` and return the outcome.
    #[instrument(skip_all, fields(target = %job.target, request_id = %job.request.id))]
    pub async fn dispatch(&self, job: ExecRequest, cancel: &CancellationToken) -> ExecResult {
        let start = Instant::now();
        let fqmn = match self.resolve(&job.target, cancel).await {
            Ok(fqmn) => fqmn,
            Err(e) => {
                debug!(error = %e, "Target resolution failed");
                return ExecResult::from_error(job.target.to_string(), e);
            }
        };
        let key = fqmn.to_string();

        let result = match self.run(&fqmn, job, cancel).await {
            Ok((output, resp_headers)) => ExecResult::response(key.as_str(), output, resp_headers),
            Err(e) => ExecResult::from_error(key.as_str(), e),
        };

        let duration_ms = start.elapsed().as_millis();
        match result.error_kind() {
            None => info!(fqmn = %key, duration_ms, "Job completed"),
            Some(kind) => warn!(fqmn = %key, duration_ms, %kind, "Job failed"),
        }
        result
    }

    async fn run(
        &self,
        fqmn: &Fqmn,
        job: ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, fabric_common::ResponseHeaders), FabricError> {
        let deadline = job
            .timeout_ms
            .map_or(self.default_timeout, Duration::from_millis);
        let pool = self.pool_for(fqmn, cancel).await?;

        let mut instance = tokio::select! {
            () = cancel.cancelled() => return Err(FabricError::canceled("acquire instance")),
            instance = pool.acquire(self.pools.pool_config().acquire_timeout()) => instance?,
        };

        let outcome = instance
            .execute(&fqmn.to_string(), job.request, cancel.child_token(), deadline)
            .await;

        if outcome.reusable {
            instance.release();
        } else {
            instance.discard();
        }

        for entry in &outcome.logs {
            debug!(level = %entry.level, message = %entry.message, "Guest log");
        }
        let output = outcome.result?;
        Ok((output, outcome.request.resp_headers))
    }

    /// Tear every pool down within the pool shutdown deadline.
    pub async fn shutdown(&self) -> usize {
        self.pools
            .shutdown(self.pools.pool_config().shutdown_timeout())
            .await
    }
}

#[async_trait]
impl Executor for Dispatcher {
    async fn exec(&self, job: ExecRequest, cancel: CancellationToken) -> ExecResult {
        self.dispatch(job, &cancel).await
    }
}
