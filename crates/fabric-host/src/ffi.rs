//! The result channel and deferred-result plumbing.
//!
//! - `return_result(ptr, len, ident)`: publish the call's output
//! - `return_error(code, ptr, len, ident)`: publish a `RunError`
//! - `return_abort(msg_ptr, msg_len, file_ptr, file_len, line, col, ident)`:
//!   guest runtime abort, published as a `RunError` with code `-1`
//! - `get_ffi_result(dest_ptr, ident)`: copy the deferred result into a
//!   guest buffer and clear the slot
//! - `add_ffi_var(name_ptr, name_len, val_ptr, val_len, ident)`: append a
//!   named variable for the next query

use futures::future::BoxFuture;
use tracing::{debug, warn};

use fabric_common::RunError;
use fabric_core::{HostCall, HostRegistry, Returns, reject};

/// Code of the `RunError` produced by `return_abort`.
pub const ABORT_CODE: i32 = -1;

/// Register the result-channel host functions.
pub fn register(registry: &mut HostRegistry) {
    registry.register("return_result", 3, Returns::Void, return_result);
    registry.register("return_error", 4, Returns::Void, return_error);
    registry.register("return_abort", 7, Returns::Void, return_abort);
    registry.register("get_ffi_result", 2, Returns::Value, get_ffi_result);
    registry.register("add_ffi_var", 5, Returns::Value, add_ffi_var);
}

fn return_result(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let (ptr, len, ident) = (call.arg(0), call.arg(1), call.ident());
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("return_result", ident, &e),
        };
        let output = match call.read_memory(ptr, len) {
            Ok(bytes) => bytes,
            Err(e) => return reject("return_result", ident, &e),
        };
        if !ctx.lock().send_result(output) {
            debug!(ident, "return_result ignored: call already published");
        }
        0
    })
}

fn return_error(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let (code, ptr, len, ident) = (call.arg(0), call.arg(1), call.arg(2), call.ident());
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("return_error", ident, &e),
        };
        let message = match call.read_memory(ptr, len) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => return reject("return_error", ident, &e),
        };
        if !ctx.lock().send_error(RunError::new(code, message)) {
            debug!(ident, "return_error ignored: call already published");
        }
        0
    })
}

fn return_abort(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("return_abort", ident, &e),
        };
        let (msg_ptr, msg_len, file_ptr, file_len) =
            (call.arg(0), call.arg(1), call.arg(2), call.arg(3));
        let (line, col) = (call.arg(4), call.arg(5));

        let message = call
            .read_memory(msg_ptr, msg_len)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        let file = call
            .read_memory(file_ptr, file_len)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();

        let text = format!("runtime abort: {message} ({file}:{line}:{col})");
        warn!(ident, fqmn = %ctx.lock().fqmn(), "{text}");
        ctx.lock().send_error(RunError::new(ABORT_CODE, text));
        0
    })
}

fn get_ffi_result(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let (dest, ident) = (call.arg(0), call.ident());
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("get_ffi_result", ident, &e),
        };
        let Some(bytes) = ctx.lock().take_ffi_result() else {
            warn!(ident, "get_ffi_result called with no pending result");
            return -1;
        };
        match call.write_memory_at(dest, &bytes) {
            Ok(()) => 0,
            Err(e) => reject("get_ffi_result", ident, &e),
        }
    })
}

fn add_ffi_var(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("add_ffi_var", ident, &e),
        };
        let (name_ptr, name_len, val_ptr, val_len) =
            (call.arg(0), call.arg(1), call.arg(2), call.arg(3));

        let name = match call.read_string(name_ptr, name_len) {
            Ok(name) => name,
            Err(e) => return reject("add_ffi_var", ident, &e),
        };
        let value = match call.read_memory(val_ptr, val_len) {
            Ok(value) => value,
            Err(e) => return reject("add_ffi_var", ident, &e),
        };
        ctx.lock().add_ffi_var(name, value);
        0
    })
}
