//! Workflow lookup.
//!
//! Workflows declared in the config file take precedence; otherwise the
//! tenant's configuration from the module source is consulted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use fabric_common::{FabricError, ModuleName, WorkflowDef};
use fabric_source::ModuleSource;

/// Known workflows, by `tenant/namespace/name`.
#[derive(Debug)]
pub struct WorkflowRegistry {
    declared: HashMap<ModuleName, WorkflowDef>,
    source: Option<Arc<dyn ModuleSource>>,
}

impl WorkflowRegistry {
    /// Registry of `declared` workflows only.
    pub fn new(declared: impl IntoIterator<Item = WorkflowDef>) -> Result<Self, FabricError> {
        let declared = declared
            .into_iter()
            .map(|workflow| Ok((workflow.module_name()?, workflow)))
            .collect::<Result<HashMap<_, _>, FabricError>>()?;
        Ok(Self {
            declared,
            source: None,
        })
    }

    /// Also look workflows up in tenant configuration from `source`.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn ModuleSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Number of workflows declared in configuration.
    pub fn declared(&self) -> usize {
        self.declared.len()
    }

    /// The workflow called `name`.
    pub async fn find(&self, name: &ModuleName) -> Result<WorkflowDef, FabricError> {
        if let Some(workflow) = self.declared.get(name) {
            return Ok(workflow.clone());
        }

        let not_found = || FabricError::not_found(format!("workflow {name}"));
        let Some(source) = &self.source else {
            return Err(not_found());
        };
        debug!(workflow = %name, "Looking up workflow in tenant config");
        let tenant = source.tenant(&name.tenant).await?;
        tenant
            .workflow(&name.namespace, &name.name)
            .cloned()
            .ok_or_else(not_found)
    }
}
