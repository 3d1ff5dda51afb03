//! Workflow declarations.
//!
//! A workflow is an ordered list of [`Step`]s. Each step is either one
//! executable module or a group of modules run in parallel.
//!
//! ```toml
//! [[workflows]]
//! tenant = "t1"
//! namespace = "default"
//! name = "greet"
//!
//! [[workflows.steps]]
//! fqmn = "echo"
//! as = "greeting"
//!
//! [[workflows.steps]]
//! fqmn = "fail"
//! on_err = { any = "continue" }
//!
//! [[workflows.steps]]
//! group = [{ fqmn = "a" }, { fqmn = "b" }]
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::exec::ExecTarget;
use crate::fqmn::{Fqmn, FqmnError, ModuleName};

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErr {
    /// Swallow the error and move on.
    Continue,
    /// Stop the sequence and return the error.
    #[default]
    Return,
}

/// Error handling policy of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    /// Action for any error without a more specific rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<OnErr>,

    /// Actions keyed by run error code.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub codes: BTreeMap<String, OnErr>,
}

impl ErrorPolicy {
    /// Policy that continues on every error.
    pub fn continue_any() -> Self {
        Self {
            any: Some(OnErr::Continue),
            codes: BTreeMap::new(),
        }
    }

    /// Action for a failure with the given run error code.
    ///
    /// Code rules win over `any`; without a matching rule the step returns.
    pub fn action_for(&self, code: Option<i32>) -> OnErr {
        code.and_then(|code| self.codes.get(&code.to_string()).copied())
            .or(self.any)
            .unwrap_or_default()
    }
}

/// One executable module within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableStep {
    /// Module to run: a bare name resolved within the workflow's tenant and
    /// namespace, or a full `fqmn://` string.
    pub fqmn: String,

    /// State key the output is stored under instead of `fqmn`.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Desired state entries: alias to source state key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,

    /// Error policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_err: Option<ErrorPolicy>,
}

impl ExecutableStep {
    /// A step running `fqmn` with no alias, inputs, or error policy.
    pub fn new(fqmn: impl Into<String>) -> Self {
        Self {
            fqmn: fqmn.into(),
            alias: None,
            with: BTreeMap::new(),
            on_err: None,
        }
    }

    /// Store the output under `alias`.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Feed `state[source]` to the module as `alias`.
    #[must_use]
    pub fn with_input(mut self, alias: impl Into<String>, source: impl Into<String>) -> Self {
        self.with.insert(alias.into(), source.into());
        self
    }

    /// Set the error policy.
    #[must_use]
    pub fn with_on_err(mut self, policy: ErrorPolicy) -> Self {
        self.on_err = Some(policy);
        self
    }

    /// The state key this step writes.
    pub fn state_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.fqmn)
    }

    /// Action for a failure of this step.
    pub fn on_err_action(&self, code: Option<i32>) -> OnErr {
        self.on_err
            .as_ref()
            .map_or(OnErr::Return, |policy| policy.action_for(code))
    }

    /// Resolve the module reference within `tenant`/`namespace`.
    pub fn target(&self, tenant: &str, namespace: &str) -> Result<ExecTarget, FqmnError> {
        if self.fqmn.starts_with("fqmn://") {
            return Ok(ExecTarget::Fqmn {
                fqmn: Fqmn::parse(&self.fqmn)?,
            });
        }
        let module = ModuleName::new(tenant, namespace, self.fqmn.as_str())?;
        Ok(ExecTarget::name(&module))
    }
}

/// A workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    /// Members run in parallel; the step completes when all have.
    Group {
        /// Members of the group.
        group: Vec<ExecutableStep>,
    },
    /// A single module.
    Single(ExecutableStep),
}

impl Step {
    /// The executable members of this step.
    pub fn members(&self) -> &[ExecutableStep] {
        match self {
            Self::Group { group } => group,
            Self::Single(step) => std::slice::from_ref(step),
        }
    }
}

/// A declared workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Owning tenant.
    pub tenant: String,
    /// Namespace within the tenant.
    pub namespace: String,
    /// Workflow name.
    pub name: String,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowDef {
    /// The `(tenant, namespace, name)` of this workflow.
    pub fn module_name(&self) -> Result<ModuleName, FqmnError> {
        ModuleName::new(&*self.tenant, &*self.namespace, &*self.name)
    }
}
