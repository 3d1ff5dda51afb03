//! `get_static_file(name_ptr, name_len, ident)`: read a bundled file.

use std::path::{Component, Path, PathBuf};

use futures::future::BoxFuture;

use fabric_common::HostCallError;
use fabric_core::{HostCall, HostRegistry, Returns, complete, reject};

/// Read-only view of the static file directory.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    /// Serve files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read `name`, relative to the root.
    ///
    /// Absolute paths and `..` components are rejected.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>, HostCallError> {
        let relative = Path::new(name);
        let clean = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(HostCallError::PermissionDenied {
                resource: format!("static file '{name}'"),
            });
        }

        tokio::fs::read(self.root.join(relative))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    HostCallError::Capability(format!("static file '{name}' not found"))
                }
                _ => HostCallError::Capability(format!("failed to read '{name}': {e}")),
            })
    }
}

/// Register `get_static_file`.
pub fn register(registry: &mut HostRegistry, files: Option<StaticFiles>) {
    registry.register("get_static_file", 3, Returns::Value, move |call| {
        get_static_file(files.clone(), call)
    });
}

fn get_static_file(files: Option<StaticFiles>, mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("get_static_file", ident, &e),
        };
        let name = match call.read_string(call.arg(0), call.arg(1)) {
            Ok(name) => name,
            Err(e) => return complete(&ctx, Err(e)),
        };

        let result = match files {
            Some(files) => files.read(&name).await,
            None => Err(HostCallError::PermissionDenied {
                resource: "static files".into(),
            }),
        };
        complete(&ctx, result)
    })
}
