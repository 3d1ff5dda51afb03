//! [`ModuleSource`] reading modules from a directory tree.
//!
//! Layout: `{root}/{tenant}/{namespace}/{name}.wasm`. A module's ref is the
//! SHA-256 of the file's current contents, so editing a file publishes a new
//! revision.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use fabric_common::{FabricError, Fqmn};
use fabric_core::content_ref;

use crate::source::{ModuleEntry, ModuleSource, Overview, TenantConfig};

const WASM_EXTENSION: &str = "wasm";

/// Modules laid out under a local directory.
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    /// Serve modules under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The module tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_path(&self, tenant: &str, namespace: &str, name: &str) -> Result<PathBuf, FabricError> {
        for segment in [tenant, namespace, name] {
            if segment == "." || segment == ".." {
                return Err(FabricError::bad_request(format!(
                    "invalid path segment '{segment}'"
                )));
            }
        }
        Ok(self
            .root
            .join(tenant)
            .join(namespace)
            .join(format!("{name}.{WASM_EXTENSION}")))
    }

    async fn modules_of(&self, tenant: &str) -> io::Result<Vec<ModuleEntry>> {
        let mut modules = Vec::new();
        let mut namespaces = tokio::fs::read_dir(self.root.join(tenant)).await?;
        while let Some(namespace) = namespaces.next_entry().await? {
            if !namespace.file_type().await?.is_dir() {
                continue;
            }
            let namespace_name = namespace.file_name().to_string_lossy().into_owned();
            let mut files = tokio::fs::read_dir(namespace.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().is_none_or(|ext| ext != WASM_EXTENSION) {
                    continue;
                }
                let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                    continue;
                };
                let bytes = tokio::fs::read(&path).await?;
                modules.push(ModuleEntry {
                    namespace: namespace_name.clone(),
                    name,
                    module_ref: content_ref(&bytes),
                });
            }
        }
        modules.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(modules)
    }
}

fn io_error(err: io::Error, what: &str) -> FabricError {
    if err.kind() == io::ErrorKind::NotFound {
        FabricError::not_found(what.to_string())
    } else {
        FabricError::from(err)
    }
}

#[async_trait]
impl ModuleSource for LocalSource {
    async fn overview(&self) -> Result<Overview, FabricError> {
        let mut overview = Overview::default();
        let mut tenants = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(e, "module directory"))?;
        while let Some(tenant) = tenants.next_entry().await? {
            if !tenant.file_type().await?.is_dir() {
                continue;
            }
            let identifier = tenant.file_name().to_string_lossy().into_owned();
            let count = self.modules_of(&identifier).await?.len();
            overview
                .tenant_refs
                .identifiers
                .insert(identifier, i64::try_from(count).unwrap_or(i64::MAX));
        }
        Ok(overview)
    }

    async fn tenant(&self, identifier: &str) -> Result<TenantConfig, FabricError> {
        if identifier == "." || identifier == ".." {
            return Err(FabricError::bad_request(format!("invalid tenant '{identifier}'")));
        }
        let modules = self
            .modules_of(identifier)
            .await
            .map_err(|e| io_error(e, &format!("tenant {identifier}")))?;
        Ok(TenantConfig {
            identifier: identifier.to_string(),
            modules,
            workflows: Vec::new(),
        })
    }

    async fn module(&self, fqmn: &Fqmn) -> Result<Vec<u8>, FabricError> {
        let path = self.module_path(&fqmn.tenant, &fqmn.namespace, &fqmn.name)?;
        debug!(path = %path.display(), "Reading module");
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(e, &format!("module {fqmn}")))
    }
}
