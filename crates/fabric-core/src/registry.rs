//! Host function registry and the FFI calling convention.
//!
//! Host functions are registered once as `{name, arity, returns, handler}`
//! and linked into every instance under the `env` import module. Every
//! function is linked twice: under its canonical name, and under the same
//! name suffixed `_swift` taking two extra trailing `i32` arguments that are
//! ignored.
//!
//! A handler receives a [`HostCall`], which wraps the Wasmtime caller and the
//! canonical arguments. The last canonical argument is always the call
//! identifier.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};
use wasmtime::{Caller, Extern, FuncType, Linker, Memory, Val, ValType};

use fabric_common::{FabricError, HostCallError};

use crate::WasmEngine;
use crate::store::{CallContext, InstanceState};

/// Import module name every host function is linked under.
pub const HOST_MODULE: &str = "env";

/// Suffix of the language-shim variant of every host function.
pub const SWIFT_SUFFIX: &str = "_swift";

/// Extra trailing arguments taken by the `_swift` variants.
const SWIFT_EXTRA_ARGS: usize = 2;

/// Whether a host function hands an `i32` back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    /// Returns an `i32`.
    Value,
    /// Returns nothing.
    Void,
}

type Handler = Arc<dyn for<'a> Fn(HostCall<'a>) -> BoxFuture<'a, i32> + Send + Sync>;

/// A registered host function.
#[derive(Clone)]
pub struct HostFn {
    name: String,
    arity: usize,
    returns: Returns,
    handler: Handler,
}

impl HostFn {
    /// Canonical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical argument count, identifier included.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Return kind.
    pub fn returns(&self) -> Returns {
        self.returns
    }
}

impl std::fmt::Debug for HostFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// The set of host functions exposed to guests.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    fns: Vec<HostFn>,
}

impl HostRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register<F>(&mut self, name: &str, arity: usize, returns: Returns, handler: F)
    where
        F: for<'a> Fn(HostCall<'a>) -> BoxFuture<'a, i32> + Send + Sync + 'static,
    {
        self.fns.retain(|f| f.name != name);
        self.fns.push(HostFn {
            name: name.to_string(),
            arity,
            returns,
            handler: Arc::new(handler),
        });
    }

    /// Look up a function by canonical name.
    pub fn get(&self, name: &str) -> Option<&HostFn> {
        self.fns.iter().find(|f| f.name == name)
    }

    /// Registered functions, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &HostFn> {
        self.fns.iter()
    }

    /// Number of registered functions (canonical names only).
    pub fn len(&self) -> usize {
        self.fns.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    /// Build a linker with WASI preview1 and every registered function, in
    /// both its canonical and `_swift` form.
    pub fn build_linker(&self, engine: &WasmEngine) -> Result<Linker<InstanceState>, FabricError> {
        let mut linker = Linker::new(engine.inner());

        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, InstanceState::wasi_mut)
            .map_err(|e| FabricError::invalid_config(format!("Failed to link WASI: {e}")))?;

        for f in &self.fns {
            link(&mut linker, engine, f, &f.name, f.arity)?;
            let swift = format!("{}{SWIFT_SUFFIX}", f.name);
            link(&mut linker, engine, f, &swift, f.arity + SWIFT_EXTRA_ARGS)?;
        }

        debug!(host_fns = self.fns.len(), "Linker built");
        Ok(linker)
    }
}

fn link(
    linker: &mut Linker<InstanceState>,
    engine: &WasmEngine,
    f: &HostFn,
    name: &str,
    arity: usize,
) -> Result<(), FabricError> {
    let results: &[ValType] = match f.returns {
        Returns::Value => &[ValType::I32],
        Returns::Void => &[],
    };
    let ty = FuncType::new(
        engine.inner(),
        std::iter::repeat_n(ValType::I32, arity),
        results.iter().cloned(),
    );

    let handler = Arc::clone(&f.handler);
    let canonical_arity = f.arity;
    let returns = f.returns;

    linker
        .func_new_async(HOST_MODULE, name, ty, move |caller, params, results| {
            let handler = Arc::clone(&handler);
            Box::new(async move {
                let args: Vec<i32> = params
                    .iter()
                    .take(canonical_arity)
                    .map(|v| v.i32().unwrap_or_default())
                    .collect();
                let ret = handler(HostCall::new(caller, args)).await;
                if returns == Returns::Value {
                    if let Some(slot) = results.first_mut() {
                        *slot = Val::I32(ret);
                    }
                }
                Ok(())
            })
        })
        .map_err(|e| FabricError::invalid_config(format!("Failed to link '{name}': {e}")))?;

    Ok(())
}

/// One invocation of a host function.
pub struct HostCall<'a> {
    caller: Caller<'a, InstanceState>,
    args: Vec<i32>,
}

impl<'a> HostCall<'a> {
    fn new(caller: Caller<'a, InstanceState>, args: Vec<i32>) -> Self {
        Self { caller, args }
    }

    /// Canonical argument `index`, or `0` if out of range.
    pub fn arg(&self, index: usize) -> i32 {
        self.args.get(index).copied().unwrap_or_default()
    }

    /// The call identifier (last canonical argument).
    pub fn ident(&self) -> i32 {
        self.args.last().copied().unwrap_or(-1)
    }

    /// Id of the calling instance.
    pub fn instance_id(&self) -> u64 {
        self.caller.data().instance_id()
    }

    /// Resolve the identifier to the call context of the calling instance.
    pub fn context(&self) -> Result<Arc<Mutex<CallContext>>, HostCallError> {
        let state = self.caller.data();
        state.idents().resolve(self.ident(), state.instance_id())
    }

    /// Resolve the call context, failing if a deferred result is pending.
    pub fn data_context(&self) -> Result<Arc<Mutex<CallContext>>, HostCallError> {
        let ctx = self.context()?;
        ctx.lock().ensure_ffi_slot_free()?;
        Ok(ctx)
    }

    /// Copy `len` bytes at `ptr` out of linear memory.
    pub fn read_memory(&mut self, ptr: i32, len: i32) -> Result<Vec<u8>, HostCallError> {
        let memory = self.memory()?;
        let range = byte_range(ptr, len)?;
        memory
            .data(&self.caller)
            .get(range)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                HostCallError::memory(format!("read of {len} bytes at {ptr} out of bounds"))
            })
    }

    /// Read a UTF-8 string of `len` bytes at `ptr`.
    pub fn read_string(&mut self, ptr: i32, len: i32) -> Result<String, HostCallError> {
        let bytes = self.read_memory(ptr, len)?;
        String::from_utf8(bytes)
            .map_err(|_| HostCallError::invalid_argument(format!("string at {ptr} is not UTF-8")))
    }

    /// Write `bytes` at `ptr` in linear memory.
    pub fn write_memory_at(&mut self, ptr: i32, bytes: &[u8]) -> Result<(), HostCallError> {
        let memory = self.memory()?;
        let offset = usize::try_from(ptr)
            .map_err(|_| HostCallError::memory(format!("negative pointer {ptr}")))?;
        memory
            .write(&mut self.caller, offset, bytes)
            .map_err(|e| HostCallError::memory(e.to_string()))
    }

    fn memory(&mut self) -> Result<Memory, HostCallError> {
        self.caller
            .get_export("memory")
            .and_then(Extern::into_memory)
            .ok_or_else(|| HostCallError::memory("guest does not export memory"))
    }
}

impl std::fmt::Debug for HostCall<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCall")
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Park `result` as the deferred result of `ctx`, returning the guest value.
///
/// An error that cannot be resolved to a context is logged and reported as
/// `-1`.
pub fn complete(
    ctx: &Arc<Mutex<CallContext>>,
    result: Result<Vec<u8>, HostCallError>,
) -> i32 {
    ctx.lock().set_ffi_result(result.map_err(|e| e.to_string()))
}

/// Log a failed context lookup and return `-1`.
pub fn reject(name: &str, ident: i32, err: &HostCallError) -> i32 {
    warn!(host_fn = name, ident, error = %err, "Host call rejected");
    -1
}

fn byte_range(ptr: i32, len: i32) -> Result<std::ops::Range<usize>, HostCallError> {
    let start = usize::try_from(ptr)
        .map_err(|_| HostCallError::memory(format!("negative pointer {ptr}")))?;
    let len = usize::try_from(len)
        .map_err(|_| HostCallError::memory(format!("negative length {len}")))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| HostCallError::memory("pointer overflow"))?;
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop(call: HostCall<'_>) -> BoxFuture<'_, i32> {
        async move { call.arg(0) }.boxed()
    }

    #[test]
    fn test_register_and_replace() {
        let mut registry = HostRegistry::new();
        registry.register("log_msg", 4, Returns::Void, noop);
        registry.register("cache_get", 3, Returns::Value, noop);
        registry.register("log_msg", 4, Returns::Void, |call| noop(call));

        assert_eq!(registry.len(), 2);
        let f = registry.get("cache_get").unwrap();
        assert_eq!(f.arity(), 3);
        assert_eq!(f.returns(), Returns::Value);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_byte_range() {
        assert_eq!(byte_range(4, 8).unwrap(), 4..12);
        assert!(byte_range(-1, 8).is_err());
        assert!(byte_range(0, -8).is_err());
    }

    #[test]
    fn test_linker_links_both_variants() {
        let engine = WasmEngine::new(&fabric_common::EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        let mut registry = HostRegistry::new();
        registry.register("cache_get", 3, Returns::Value, noop);

        let linker = registry.build_linker(&engine).unwrap();
        let mut store = wasmtime::Store::new(
            engine.inner(),
            InstanceState::new(
                1,
                Arc::new(crate::IdentifierRegistry::new()),
                &fabric_common::ExecutionConfig::default(),
            ),
        );
        assert!(linker.get(&mut store, HOST_MODULE, "cache_get").is_some());
        assert!(linker.get(&mut store, HOST_MODULE, "cache_get_swift").is_some());
    }
}
