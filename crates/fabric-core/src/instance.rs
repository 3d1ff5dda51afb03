//! One live WebAssembly instance.
//!
//! An [`Instance`] owns a store, its linear memory, the guest ABI exports,
//! and the one-slot result and error channels guests publish into through
//! `return_result` and `return_error`. At most one call is in flight on an
//! instance; [`Instance::execute`] takes `&mut self` to make that structural.
//!
//! A call goes through these steps:
//!
//! 1. Bind a fresh [`CallContext`] and copy the request body into guest memory
//! 2. Register an identifier for the call
//! 3. Invoke `run_e(ptr, len, ident)` under the call deadline
//! 4. Drain the result and error channels
//! 5. Release the identifier, free the input buffer and unbind the context

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wasmtime::{Linker, Memory, Store, Trap, TypedFunc, Val};

use fabric_common::{CoordinatedRequest, ExecutionConfig, FabricError, RunError};

use crate::WasmEngine;
use crate::ident::IdentifierRegistry;
use crate::module::CompiledModule;
use crate::store::{CallContext, InstanceState, LogEntry};

/// Failure of [`Instance::call`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The export does not exist or is not a function.
    #[error("export '{0}' not found")]
    ExportNotFound(String),

    /// The call trapped.
    #[error("trap: {0}")]
    Trap(String),
}

impl From<CallError> for FabricError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::ExportNotFound(name) => {
                FabricError::invariant(format!("export '{name}' not found"))
            }
            CallError::Trap(message) => FabricError::trap(message),
        }
    }
}

/// What came out of one call.
#[derive(Debug)]
pub struct CallOutcome {
    /// Guest output, or why there is none.
    pub result: Result<Vec<u8>, FabricError>,
    /// The request as the guest left it (response headers included).
    pub request: CoordinatedRequest,
    /// Guest log entries.
    pub logs: Vec<LogEntry>,
    /// `false` if the instance must not be reused.
    pub reusable: bool,
}

/// One live Wasm instance.
pub struct Instance {
    id: u64,
    store: Store<InstanceState>,
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    deallocate: TypedFunc<(i32, i32), ()>,
    run_e: TypedFunc<(i32, i32, i32), i32>,
    instance: wasmtime::Instance,
    result_tx: mpsc::Sender<Vec<u8>>,
    result_rx: mpsc::Receiver<Vec<u8>>,
    error_tx: mpsc::Sender<RunError>,
    error_rx: mpsc::Receiver<RunError>,
    idents: Arc<IdentifierRegistry>,
    max_fuel: Option<u64>,
    epochs: bool,
}

impl Instance {
    /// Instantiate `module`, run its optional `_start` and `init` exports,
    /// and resolve the guest ABI.
    ///
    /// # Errors
    ///
    /// Returns `Invariant` if instantiation fails or a required export has the
    /// wrong signature, and `Trap` if `_start` or `init` traps.
    #[instrument(skip_all, fields(module_ref = %module.module_ref()))]
    pub async fn new(
        engine: &WasmEngine,
        module: &CompiledModule,
        linker: &Linker<InstanceState>,
        idents: Arc<IdentifierRegistry>,
        config: &ExecutionConfig,
    ) -> Result<Self, FabricError> {
        let id = idents.next_instance_id();
        let mut store = Store::new(
            engine.inner(),
            InstanceState::new(id, Arc::clone(&idents), config),
        );
        store.limiter(|state| state.limits_mut());

        let max_fuel = engine.is_fuel_enabled().then_some(config.max_fuel);
        let epochs = engine.is_epoch_enabled();
        arm_store(&mut store, max_fuel, epochs)?;

        let instance = linker
            .instantiate_async(&mut store, module.module())
            .await
            .map_err(|e| FabricError::invariant(format!("Instantiation failed: {e}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| FabricError::invariant("module does not export 'memory'"))?;
        let allocate = typed(&instance, &mut store, "allocate")?;
        let deallocate = typed(&instance, &mut store, "deallocate")?;
        let run_e = typed(&instance, &mut store, "run_e")?;

        let (result_tx, result_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);

        let mut this = Self {
            id,
            store,
            memory,
            allocate,
            deallocate,
            run_e,
            instance,
            result_tx,
            result_rx,
            error_tx,
            error_rx,
            idents,
            max_fuel,
            epochs,
        };

        this.call_optional("_start").await?;
        this.call_optional("init").await?;

        debug!(instance_id = id, "Instance ready");
        Ok(this)
    }

    /// Process-unique id of this instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Call an exported function with integer arguments.
    ///
    /// Returns the first result, if the function has one.
    pub async fn call(&mut self, name: &str, args: &[i32]) -> Result<Option<i32>, CallError> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| CallError::ExportNotFound(name.to_string()))?;

        let params: Vec<Val> = args.iter().copied().map(Val::I32).collect();
        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];

        func.call_async(&mut self.store, &params, &mut results)
            .await
            .map_err(|e| CallError::Trap(describe_trap(&e)))?;

        Ok(results.first().and_then(Val::i32))
    }

    /// Copy `len` bytes at `ptr` out of linear memory.
    ///
    /// Returns an empty vector if the range is invalid.
    pub fn read_memory(&self, ptr: i32, len: i32) -> Vec<u8> {
        let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
            return Vec::new();
        };
        start
            .checked_add(len)
            .and_then(|end| self.memory.data(&self.store).get(start..end))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// Allocate a guest buffer through `allocate` and copy `bytes` into it.
    pub async fn write_memory(&mut self, bytes: &[u8]) -> Result<i32, CallError> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| CallError::Trap(format!("{} bytes exceed i32", bytes.len())))?;
        let ptr = self
            .allocate
            .call_async(&mut self.store, len)
            .await
            .map_err(|e| CallError::Trap(describe_trap(&e)))?;
        self.write_memory_at(ptr, bytes)?;
        Ok(ptr)
    }

    /// Copy `bytes` to `ptr` in linear memory.
    pub fn write_memory_at(&mut self, ptr: i32, bytes: &[u8]) -> Result<(), CallError> {
        let offset = usize::try_from(ptr)
            .map_err(|_| CallError::Trap(format!("negative pointer {ptr}")))?;
        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|e| CallError::Trap(format!("out of bounds write at {ptr}: {e}")))
    }

    /// Free a guest buffer through `deallocate`. Failures are logged.
    pub async fn deallocate(&mut self, ptr: i32, len: i32) {
        if let Err(e) = self.deallocate.call_async(&mut self.store, (ptr, len)).await {
            warn!(instance_id = self.id, ptr, len, error = %e, "deallocate failed");
        }
    }

    /// Drain the result and error channels without waiting.
    ///
    /// Returns `None` if the guest published neither.
    pub fn execution_result(&mut self) -> Option<Result<Vec<u8>, RunError>> {
        if let Ok(error) = self.error_rx.try_recv() {
            return Some(Err(error));
        }
        self.result_rx.try_recv().ok().map(Ok)
    }

    /// Run one call of `run_e` with `request` bound.
    ///
    /// The call is abandoned when `deadline` elapses or `cancel` fires; an
    /// abandoned instance is reported as not reusable.
    #[instrument(skip_all, fields(instance_id = self.id, fqmn = %fqmn, request_id = %request.id))]
    pub async fn execute(
        &mut self,
        fqmn: &str,
        request: CoordinatedRequest,
        cancel: CancellationToken,
        deadline: Duration,
    ) -> CallOutcome {
        let start = Instant::now();
        let body = request.body.clone();
        let ctx = Arc::new(Mutex::new(CallContext::new(
            fqmn.to_string(),
            request,
            self.result_tx.clone(),
            self.error_tx.clone(),
            cancel.clone(),
        )));

        let (result, reusable) = self.run_bound(&ctx, &body, &cancel, deadline).await;

        let (request, logs) = ctx.lock().finish();
        let duration_ms = start.elapsed().as_millis();
        match &result {
            Ok(output) => debug!(duration_ms, output_len = output.len(), "Call completed"),
            Err(e) => debug!(duration_ms, error = %e, reusable, "Call failed"),
        }

        CallOutcome {
            result,
            request,
            logs,
            reusable,
        }
    }

    async fn run_bound(
        &mut self,
        ctx: &Arc<Mutex<CallContext>>,
        body: &[u8],
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> (Result<Vec<u8>, FabricError>, bool) {
        // Leftovers from an earlier call must not leak into this one.
        while self.result_rx.try_recv().is_ok() {}
        while self.error_rx.try_recv().is_ok() {}

        if let Err(e) = arm_store(&mut self.store, self.max_fuel, self.epochs) {
            return (Err(e), false);
        }

        let ptr = match self.write_memory(body).await {
            Ok(ptr) => ptr,
            Err(e) => return (Err(e.into()), false),
        };
        let len = i32::try_from(body.len()).unwrap_or(i32::MAX);

        let guard = self.idents.register(self.id, Arc::clone(ctx));
        let ident = guard.ident();

        let call = self.run_e.call_async(&mut self.store, (ptr, len, ident));
        let outcome = tokio::select! {
            res = tokio::time::timeout(deadline, call) => match res {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(FabricError::trap(describe_trap(&e))),
                Err(_) => Err(FabricError::timeout(
                    "run_e",
                    u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                )),
            },
            () = cancel.cancelled() => Err(FabricError::canceled("run_e")),
        };
        drop(guard);

        match outcome {
            Ok(()) => {
                self.deallocate(ptr, len).await;
                let result = match self.execution_result() {
                    Some(Ok(output)) => Ok(output),
                    Some(Err(run)) => Err(FabricError::Run(run)),
                    None => Err(FabricError::NoResult),
                };
                (result, true)
            }
            Err(e) => {
                if matches!(e, FabricError::Timeout { .. }) {
                    cancel.cancel();
                }
                if matches!(e, FabricError::Trap { .. }) {
                    error!(instance_id = self.id, error = %e, "Guest trapped");
                }
                (Err(e), false)
            }
        }
    }

    async fn call_optional(&mut self, name: &str) -> Result<(), FabricError> {
        let Some(func) = self.instance.get_func(&mut self.store, name) else {
            return Ok(());
        };
        let Ok(func) = func.typed::<(), ()>(&self.store) else {
            warn!(export = name, "Skipping export with unexpected signature");
            return Ok(());
        };

        match func.call_async(&mut self.store, ()).await {
            Ok(()) => Ok(()),
            Err(e) => match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Some(exit) if exit.0 == 0 => Ok(()),
                Some(exit) => Err(FabricError::trap(format!(
                    "'{name}' exited with code {}",
                    exit.0
                ))),
                None => Err(FabricError::trap(format!(
                    "'{name}' trapped: {}",
                    describe_trap(&e)
                ))),
            },
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Reset fuel and the epoch deadline before running guest code.
fn arm_store(
    store: &mut Store<InstanceState>,
    max_fuel: Option<u64>,
    epochs: bool,
) -> Result<(), FabricError> {
    if let Some(fuel) = max_fuel {
        store
            .set_fuel(fuel)
            .map_err(|e| FabricError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }
    if epochs {
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);
    }
    Ok(())
}

fn typed<P, R>(
    instance: &wasmtime::Instance,
    store: &mut Store<InstanceState>,
    name: &str,
) -> Result<TypedFunc<P, R>, FabricError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(store, name)
        .map_err(|e| FabricError::invariant(format!("export '{name}' has the wrong type: {e}")))
}

/// Human-readable trap description.
fn describe_trap(error: &wasmtime::Error) -> String {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => "fuel exhausted".to_string(),
        Some(trap) => format!("{trap}: {error}"),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_conversion() {
        let err: FabricError = CallError::ExportNotFound("init".into()).into();
        assert_eq!(err.kind(), fabric_common::ErrorKind::Invariant);

        let err: FabricError = CallError::Trap("unreachable".into()).into();
        assert_eq!(err.kind(), fabric_common::ErrorKind::Trap);
    }
}
