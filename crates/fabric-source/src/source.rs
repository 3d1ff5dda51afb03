//! The module source abstraction and its wire types.
//!
//! A [`ModuleSource`] is the source of truth for which modules exist, what
//! their latest refs are and what bytes a ref names. Two implementations
//! exist: [`HttpSource`](crate::HttpSource), talking to the source service,
//! and [`LocalSource`](crate::LocalSource), reading a directory tree.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fabric_common::{FabricError, Fqmn, ModuleName, WorkflowDef};

/// `GET /system/v1/overview`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overview {
    /// Per-tenant module counts.
    #[serde(default)]
    pub tenant_refs: TenantRefs,
}

/// Module counts keyed by tenant identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRefs {
    #[serde(default)]
    pub identifiers: BTreeMap<String, i64>,
}

/// `GET /system/v1/tenant/{ident}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant identifier.
    pub identifier: String,

    /// Latest revision of every module the tenant has.
    #[serde(default)]
    pub modules: Vec<ModuleEntry>,

    /// Workflows the tenant declares.
    #[serde(default)]
    pub workflows: Vec<WorkflowDef>,
}

impl TenantConfig {
    /// The entry for `namespace/name`.
    pub fn module(&self, namespace: &str, name: &str) -> Option<&ModuleEntry> {
        self.modules
            .iter()
            .find(|m| m.namespace == namespace && m.name == name)
    }

    /// The entry whose ref is `module_ref`.
    pub fn module_by_ref(&self, module_ref: &str) -> Option<&ModuleEntry> {
        self.modules
            .iter()
            .find(|m| m.module_ref.eq_ignore_ascii_case(module_ref))
    }

    /// The workflow named `namespace/name`.
    pub fn workflow(&self, namespace: &str, name: &str) -> Option<&WorkflowDef> {
        self.workflows
            .iter()
            .find(|w| w.namespace == namespace && w.name == name)
    }
}

/// One module in a [`TenantConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "ref")]
    pub module_ref: String,
}

/// `GET /system/v1/module/{tenant}/{ref}/{namespace}/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEnvelope {
    pub wasm_ref: WasmRef,
}

/// Module bytes, base64 on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WasmRef {
    #[serde(with = "fabric_common::b64")]
    pub data: Vec<u8>,
}

/// Where modules come from.
#[async_trait]
pub trait ModuleSource: Send + Sync + Debug {
    /// Every tenant with the number of modules it has.
    async fn overview(&self) -> Result<Overview, FabricError>;

    /// A tenant's modules and workflows.
    ///
    /// Returns `NotFound` if the tenant does not exist.
    async fn tenant(&self, identifier: &str) -> Result<TenantConfig, FabricError>;

    /// The bytes of the revision `fqmn` names.
    ///
    /// Returns `NotFound` if there is no such revision. Bytes are returned
    /// as served; callers verify them against the ref.
    async fn module(&self, fqmn: &Fqmn) -> Result<Vec<u8>, FabricError>;

    /// The current ref of `module`.
    async fn latest_ref(&self, module: &ModuleName) -> Result<String, FabricError> {
        let tenant = self.tenant(&module.tenant).await?;
        tenant
            .module(&module.namespace, &module.name)
            .map(|entry| entry.module_ref.clone())
            .ok_or_else(|| FabricError::not_found(format!("module {module}")))
    }

    /// The module whose current ref is `module_ref`, searched across every
    /// tenant.
    async fn find_ref(&self, module_ref: &str) -> Result<Fqmn, FabricError> {
        let overview = self.overview().await?;
        for identifier in overview.tenant_refs.identifiers.keys() {
            let tenant = match self.tenant(identifier).await {
                Ok(tenant) => tenant,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if let Some(entry) = tenant.module_by_ref(module_ref) {
                return Ok(Fqmn::new(
                    identifier.as_str(),
                    entry.namespace.as_str(),
                    entry.name.as_str(),
                    entry.module_ref.as_str(),
                )?);
            }
        }
        Err(FabricError::not_found(format!("ref {module_ref}")))
    }
}
