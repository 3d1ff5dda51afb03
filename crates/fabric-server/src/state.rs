//! Shared application state.
//!
//! [`AppState`] holds the dispatcher, the workflow registry and the optional
//! authorizer. It is cloned for each request, so everything is behind `Arc`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use fabric_common::{FabricError, RuntimeConfig, WorkflowDef};
use fabric_core::{IdentifierRegistry, PoolSet, WasmEngine};
use fabric_dispatch::{DEFAULT_TIMEOUT, Dispatcher, Executor, WorkflowRegistry};
use fabric_host::{Capabilities, host_registry};
use fabric_source::{Authorizer, ModuleCache, source_from_config};

/// Shared state across all request handlers.
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    workflows: Arc<WorkflowRegistry>,
    authorizer: Option<Arc<Authorizer>>,
    step_timeout: Duration,
}

impl AppState {
    /// State over an existing dispatcher, with authorization disabled.
    pub fn new(dispatcher: Arc<Dispatcher>, workflows: Arc<WorkflowRegistry>) -> Self {
        Self {
            dispatcher,
            workflows,
            authorizer: None,
            step_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Require bearer authorization on tenant-scoped routes.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Deadline for each workflow step.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Build the whole execution stack from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine, a capability, the module source or
    /// the authorizer cannot be set up, or if a declared workflow has an
    /// invalid name.
    pub fn from_config(
        config: &RuntimeConfig,
        workflows: Vec<WorkflowDef>,
    ) -> Result<Self, FabricError> {
        let engine = WasmEngine::new(&config.engine)?;
        let capabilities = Capabilities::from_config(&config.capabilities)?;
        let linker = host_registry(&capabilities).build_linker(&engine)?;
        let pools = PoolSet::new(
            engine,
            linker,
            Arc::new(IdentifierRegistry::new()),
            config.execution.clone(),
            config.pool.clone(),
        );

        let source = source_from_config(&config.source)?;
        let modules = ModuleCache::new(Arc::clone(&source), &config.source);
        let dispatcher = Dispatcher::new(Arc::new(pools), Arc::new(modules))
            .with_default_timeout(config.execution.timeout());
        let workflows = WorkflowRegistry::new(workflows)?.with_source(source);

        info!(
            source = ?config.source.kind,
            workflows = workflows.declared(),
            auth = config.auth.enabled,
            "Execution stack ready"
        );

        let mut state = Self::new(Arc::new(dispatcher), Arc::new(workflows))
            .with_step_timeout(config.execution.timeout());
        if config.auth.enabled {
            state = state.with_authorizer(Arc::new(Authorizer::new(&config.auth)?));
        }
        Ok(state)
    }

    /// The in-process dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The dispatcher as an [`Executor`] for sequences.
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.dispatcher) as Arc<dyn Executor>
    }

    /// Known workflows.
    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// The authorizer, if authorization is enabled.
    pub fn authorizer(&self) -> Option<&Arc<Authorizer>> {
        self.authorizer.as_ref()
    }

    /// Deadline for each workflow step.
    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("pools", &self.dispatcher.pools().len())
            .field("workflows", &self.workflows.declared())
            .field("auth", &self.authorizer.is_some())
            .finish_non_exhaustive()
    }
}
