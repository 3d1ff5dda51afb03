//! Per-instance store data and per-call scratch state.
//!
//! This module provides:
//! - [`InstanceState`]: The Wasmtime store data of one instance
//! - [`CallContext`]: Per-call state reachable from host functions through the
//!   identifier registry
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wasmtime::{StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use fabric_common::{CoordinatedRequest, ExecutionConfig, HostCallError, RunError};

use crate::ident::IdentifierRegistry;

/// Store data of one instance.
///
/// Lives as long as the instance. Everything that changes per call lives in
/// [`CallContext`] instead.
pub struct InstanceState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    instance_id: u64,
    idents: Arc<IdentifierRegistry>,
}

impl InstanceState {
    /// Create the store data for instance `instance_id`.
    pub fn new(
        instance_id: u64,
        idents: Arc<IdentifierRegistry>,
        config: &ExecutionConfig,
    ) -> Self {
        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .build();

        Self {
            wasi,
            limits,
            instance_id,
            idents,
        }
    }

    /// Identifier of the owning instance.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// The identifier registry host functions resolve against.
    pub fn idents(&self) -> &Arc<IdentifierRegistry> {
        &self.idents
    }

    /// WASI preview1 context.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    pub(crate) fn limits_mut(&mut self) -> &mut StoreLimits {
        &mut self.limits
    }
}

/// A named value appended through `add_ffi_var`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiVar {
    /// Variable name.
    pub name: String,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

/// Per-call scratch state.
///
/// Created when a call is bound to an instance and dropped when it ends.
/// Host functions reach it through the identifier they were given.
#[derive(Debug)]
pub struct CallContext {
    fqmn: String,
    request: CoordinatedRequest,
    ffi_result: Option<Result<Vec<u8>, String>>,
    ffi_vars: Vec<FfiVar>,
    result_tx: mpsc::Sender<Vec<u8>>,
    error_tx: mpsc::Sender<RunError>,
    published: bool,
    cancel: CancellationToken,
    logs: Vec<LogEntry>,
    outbound_requests: u32,
}

impl CallContext {
    pub(crate) fn new(
        fqmn: String,
        request: CoordinatedRequest,
        result_tx: mpsc::Sender<Vec<u8>>,
        error_tx: mpsc::Sender<RunError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fqmn,
            request,
            ffi_result: None,
            ffi_vars: Vec::new(),
            result_tx,
            error_tx,
            published: false,
            cancel,
            logs: Vec::new(),
            outbound_requests: 0,
        }
    }

    /// Canonical FQMN of the module being run.
    pub fn fqmn(&self) -> &str {
        &self.fqmn
    }

    /// The bound request.
    pub fn request(&self) -> &CoordinatedRequest {
        &self.request
    }

    /// The bound request, mutably.
    pub fn request_mut(&mut self) -> &mut CoordinatedRequest {
        &mut self.request
    }

    /// Cancellation token of the job.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` if a deferred result waits to be collected.
    pub fn has_pending_ffi_result(&self) -> bool {
        self.ffi_result.is_some()
    }

    /// Fail with `HostCallInProgress` if a deferred result is pending.
    pub fn ensure_ffi_slot_free(&self) -> Result<(), HostCallError> {
        if self.has_pending_ffi_result() {
            return Err(HostCallError::HostCallInProgress);
        }
        Ok(())
    }

    /// Park a deferred result and return the value handed to the guest.
    ///
    /// Success returns the byte length; failure parks the error text and
    /// returns its negated length.
    pub fn set_ffi_result(&mut self, result: Result<Vec<u8>, String>) -> i32 {
        let ret = match &result {
            Ok(bytes) => len_to_i32(bytes.len()),
            Err(message) => -len_to_i32(message.len()),
        };
        self.ffi_result = Some(result);
        ret
    }

    /// Take the deferred result as raw bytes, clearing the slot.
    pub fn take_ffi_result(&mut self) -> Option<Vec<u8>> {
        self.ffi_result.take().map(|result| match result {
            Ok(bytes) => bytes,
            Err(message) => message.into_bytes(),
        })
    }

    /// Append a named variable.
    pub fn add_ffi_var(&mut self, name: String, value: Vec<u8>) {
        self.ffi_vars.push(FfiVar { name, value });
    }

    /// The variables appended so far, in order.
    pub fn ffi_vars(&self) -> &[FfiVar] {
        &self.ffi_vars
    }

    /// Take every variable, leaving the list empty.
    pub fn take_ffi_vars(&mut self) -> Vec<FfiVar> {
        std::mem::take(&mut self.ffi_vars)
    }

    /// Publish the call's successful output.
    ///
    /// Returns `false` if the call already published an output or an error.
    pub fn send_result(&mut self, output: Vec<u8>) -> bool {
        if self.published {
            return false;
        }
        self.published = self.result_tx.try_send(output).is_ok();
        self.published
    }

    /// Publish the call's error.
    ///
    /// Returns `false` if the call already published an output or an error.
    pub fn send_error(&mut self, error: RunError) -> bool {
        if self.published {
            return false;
        }
        self.published = self.error_tx.try_send(error).is_ok();
        self.published
    }

    /// Record a guest log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Guest log entries recorded so far.
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Count one outbound request, returning the total so far.
    pub fn count_outbound_request(&mut self) -> u32 {
        self.outbound_requests = self.outbound_requests.saturating_add(1);
        self.outbound_requests
    }

    /// Move the request and logs out, leaving the context empty.
    pub(crate) fn finish(&mut self) -> (CoordinatedRequest, Vec<LogEntry>) {
        self.ffi_result = None;
        self.ffi_vars.clear();
        (
            std::mem::take(&mut self.request),
            std::mem::take(&mut self.logs),
        )
    }
}

fn len_to_i32(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (
        CallContext,
        mpsc::Receiver<Vec<u8>>,
        mpsc::Receiver<RunError>,
    ) {
        let (result_tx, result_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let ctx = CallContext::new(
            "fqmn://t/ns/m@r".into(),
            CoordinatedRequest::new("POST", "/", b"in".to_vec()),
            result_tx,
            error_tx,
            CancellationToken::new(),
        );
        (ctx, result_rx, error_rx)
    }

    #[test]
    fn test_ffi_result_convention() {
        let (mut ctx, _, _) = context();

        assert!(ctx.ensure_ffi_slot_free().is_ok());
        assert_eq!(ctx.set_ffi_result(Ok(b"hello".to_vec())), 5);
        assert_eq!(
            ctx.ensure_ffi_slot_free(),
            Err(HostCallError::HostCallInProgress)
        );
        assert_eq!(ctx.take_ffi_result().unwrap(), b"hello");
        assert!(ctx.take_ffi_result().is_none());

        assert_eq!(ctx.set_ffi_result(Err("boom".into())), -4);
        assert_eq!(ctx.take_ffi_result().unwrap(), b"boom");
    }

    #[test]
    fn test_ffi_vars_in_order() {
        let (mut ctx, _, _) = context();
        ctx.add_ffi_var("a".into(), b"1".to_vec());
        ctx.add_ffi_var("b".into(), b"2".to_vec());
        assert_eq!(ctx.ffi_vars().len(), 2);

        let vars = ctx.take_ffi_vars();
        assert_eq!(vars[0].name, "a");
        assert_eq!(vars[1].value, b"2");
        assert!(ctx.ffi_vars().is_empty());
    }

    #[test]
    fn test_publish_at_most_once() {
        let (mut ctx, mut results, mut errors) = context();

        assert!(ctx.send_result(b"out".to_vec()));
        assert!(!ctx.send_result(b"again".to_vec()));
        assert!(!ctx.send_error(RunError::new(500, "late")));

        assert_eq!(results.try_recv().unwrap(), b"out");
        assert!(results.try_recv().is_err());
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_logging_and_finish() {
        let (mut ctx, _, _) = context();
        ctx.log(LogLevel::Info, "Hello".into());
        ctx.log(LogLevel::Error, "World".into());
        assert_eq!(ctx.logs().len(), 2);
        assert_eq!(ctx.logs()[1].level, LogLevel::Error);

        let (request, logs) = ctx.finish();
        assert_eq!(request.body, b"in");
        assert_eq!(logs.len(), 2);
        assert!(ctx.logs().is_empty());
    }

    #[test]
    fn test_outbound_counter() {
        let (mut ctx, _, _) = context();
        assert_eq!(ctx.count_outbound_request(), 1);
        assert_eq!(ctx.count_outbound_request(), 2);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
        assert_eq!(LogLevel::Info.to_string(), "INFO");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }
}
