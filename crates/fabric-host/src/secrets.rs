//! `get_secret_value(name_ptr, name_len, ident)`: resolve an allow-listed
//! secret from configuration, falling back to the process environment.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use fabric_common::{HostCallError, SecretsConfig};
use fabric_core::{HostCall, HostRegistry, Returns, complete, reject};

/// Allow-listed secret values.
#[derive(Clone, Default)]
pub struct Secrets {
    allowed: HashSet<String>,
    values: BTreeMap<String, String>,
}

impl Secrets {
    /// Build from configuration.
    pub fn from_config(config: &SecretsConfig) -> Self {
        Self {
            allowed: config.allowed.iter().cloned().collect(),
            values: config.values.clone(),
        }
    }

    /// Resolve `name`.
    pub fn get(&self, name: &str) -> Result<String, HostCallError> {
        if !self.allowed.contains(name) {
            return Err(HostCallError::PermissionDenied {
                resource: format!("secret '{name}'"),
            });
        }
        self.values
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .ok_or_else(|| HostCallError::Capability(format!("secret '{name}' is not set")))
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("allowed", &self.allowed)
            .finish_non_exhaustive()
    }
}

/// Register `get_secret_value`.
pub fn register(registry: &mut HostRegistry, secrets: Arc<Secrets>) {
    registry.register("get_secret_value", 3, Returns::Value, move |call| {
        get_secret_value(Arc::clone(&secrets), call)
    });
}

fn get_secret_value(secrets: Arc<Secrets>, mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("get_secret_value", ident, &e),
        };
        let result = call
            .read_string(call.arg(0), call.arg(1))
            .and_then(|name| secrets.get(&name))
            .map(String::into_bytes);
        if let Err(HostCallError::PermissionDenied { resource }) = &result {
            warn!(fqmn = %ctx.lock().fqmn(), resource = %resource, "Secret access denied");
        }
        complete(&ctx, result)
    })
}
