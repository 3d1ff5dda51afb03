//! Error types for the fabric.
//!
//! This module defines the error taxonomy shared by every crate:
//! - [`FabricError`]: Top-level errors, one variant per failure category
//! - [`ErrorKind`]: The category of a failure, carried across the wire in
//!   [`ExecResult`](crate::ExecResult)s
//! - [`HostCallError`]: Errors from host function implementations

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::RunError;
use crate::fqmn::FqmnError;

/// Category of a failure.
///
/// The sequencer decides whether an `on_err` policy applies by looking at the
/// kind, and the HTTP surface maps kinds to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credential missing, empty, or rejected.
    Access,
    /// Credential valid but not for the requested tenant.
    Forbidden,
    /// Module, workflow or ref absent in the source.
    NotFound,
    /// Explicit guest-side failure.
    Run,
    /// Unrecoverable Wasm trap.
    Trap,
    /// Per-call or per-acquire deadline elapsed.
    Timeout,
    /// Caller or upstream cancellation.
    Canceled,
    /// A data-returning host call was made while a result was pending.
    HostCallInProgress,
    /// Upstream 5xx or network failure.
    Transient,
    /// Guest missing a required export or violating the ABI.
    Invariant,
    /// Guest returned without publishing a result or an error.
    NoResult,
    /// Malformed inbound request.
    BadRequest,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// HTTP status code used when this kind reaches the HTTP surface.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Access => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::Timeout => 504,
            _ => 500,
        }
    }

    /// Returns `true` if an `on_err` policy may swallow this kind.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Run | Self::Trap)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Access => "access",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Run => "run",
            Self::Trap => "trap",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::HostCallInProgress => "host_call_in_progress",
            Self::Transient => "transient",
            Self::Invariant => "invariant",
            Self::NoResult => "no_result",
            Self::BadRequest => "bad_request",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Top-level fabric errors.
#[derive(Error, Debug, Clone)]
pub enum FabricError {
    /// The credential was missing, empty, or rejected.
    #[error("Access denied: {reason}")]
    Access {
        /// Why access was denied.
        reason: String,
    },

    /// The credential does not grant access to the requested tenant.
    #[error("Forbidden: {reason}")]
    Forbidden {
        /// Why the request was forbidden.
        reason: String,
    },

    /// The requested module, workflow or ref was not found.
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// The guest reported an error through `return_error` or `return_abort`.
    #[error(transparent)]
    Run(#[from] RunError),

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// A deadline elapsed.
    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout {
        /// What timed out.
        operation: String,
        /// The deadline in milliseconds.
        duration_ms: u64,
    },

    /// The operation was canceled.
    #[error("Canceled: {operation}")]
    Canceled {
        /// What was canceled.
        operation: String,
    },

    /// A data-returning host call was attempted with a result still pending.
    #[error("Host call already in progress")]
    HostCallInProgress,

    /// An upstream service failed in a way that may succeed on retry.
    #[error("Transient upstream failure: {reason}")]
    Transient {
        /// Description of the upstream failure.
        reason: String,
    },

    /// The guest module violates the embedding contract.
    #[error("Module invariant violated: {reason}")]
    Invariant {
        /// Description of the violation.
        reason: String,
    },

    /// The guest returned without calling `return_result` or `return_error`.
    #[error("Module returned without a result")]
    NoResult,

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    Compilation {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The inbound request was malformed.
    #[error("Bad request: {reason}")]
    BadRequest {
        /// Description of the problem.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for FabricError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl FabricError {
    /// Create a new `Access` error.
    pub fn access(reason: impl Into<String>) -> Self {
        Self::Access {
            reason: reason.into(),
        }
    }

    /// Create a new `Forbidden` error.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// Create a new `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `Timeout` error.
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create a new `Canceled` error.
    pub fn canceled(operation: impl Into<String>) -> Self {
        Self::Canceled {
            operation: operation.into(),
        }
    }

    /// Create a new `Transient` error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Create a new `Invariant` error.
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::Invariant {
            reason: reason.into(),
        }
    }

    /// Create a new `Compilation` error.
    pub fn compilation(reason: impl Into<String>) -> Self {
        Self::Compilation {
            reason: reason.into(),
        }
    }

    /// Create a new `BadRequest` error.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Access { .. } => ErrorKind::Access,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Run(_) => ErrorKind::Run,
            Self::Trap { .. } => ErrorKind::Trap,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::HostCallInProgress => ErrorKind::HostCallInProgress,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Invariant { .. } | Self::Compilation { .. } => ErrorKind::Invariant,
            Self::NoResult => ErrorKind::NoResult,
            Self::BadRequest { .. } => ErrorKind::BadRequest,
            Self::InvalidConfig { .. } | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if this error indicates the target was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from host function implementations.
///
/// These never cross into the guest as traps: every host function turns
/// them into a negative return value and, for data-returning functions, a
/// textual error parked in the deferred result slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostCallError {
    /// The identifier passed by the guest is not bound to any call.
    #[error("Unknown identifier: {ident}")]
    UnknownIdentifier {
        /// The identifier supplied by the guest.
        ident: i32,
    },

    /// The identifier is bound to a different instance than the caller.
    #[error("Identifier {ident} does not belong to the calling instance")]
    IdentifierMismatch {
        /// The identifier supplied by the guest.
        ident: i32,
    },

    /// A deferred result is still waiting to be collected.
    #[error("Host call already in progress")]
    HostCallInProgress,

    /// A pointer/length pair fell outside linear memory.
    #[error("Memory access failed: {reason}")]
    MemoryAccess {
        /// Description of the failure.
        reason: String,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The requested operation was denied by the permission system.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// The operation was canceled together with its job.
    #[error("Canceled")]
    Canceled,

    /// The capability itself failed.
    #[error("{0}")]
    Capability(String),
}

impl HostCallError {
    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `MemoryAccess` error.
    pub fn memory(reason: impl Into<String>) -> Self {
        Self::MemoryAccess {
            reason: reason.into(),
        }
    }
}

impl From<FqmnError> for FabricError {
    fn from(err: FqmnError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<HostCallError> for FabricError {
    fn from(err: HostCallError) -> Self {
        match err {
            HostCallError::HostCallInProgress => Self::HostCallInProgress,
            HostCallError::Canceled => Self::canceled("host call"),
            HostCallError::PermissionDenied { resource } => Self::forbidden(resource),
            other => Self::invariant(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FabricError::not_found("fqmn://t/ns/echo@abc");
        assert_eq!(err.to_string(), "Not found: fqmn://t/ns/echo@abc");

        let err = FabricError::HostCallInProgress;
        assert_eq!(err.to_string(), "Host call already in progress");
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(FabricError::access("empty").kind(), ErrorKind::Access);
        assert_eq!(FabricError::trap("unreachable").kind(), ErrorKind::Trap);
        assert_eq!(
            FabricError::Run(RunError::new(418, "teapot")).kind(),
            ErrorKind::Run
        );
        assert_eq!(FabricError::compilation("bad").kind(), ErrorKind::Invariant);
        assert_eq!(FabricError::timeout("run_e", 10).kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorKind::Access.http_status(), 401);
        assert_eq!(ErrorKind::Forbidden.http_status(), 403);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::BadRequest.http_status(), 400);
        assert_eq!(ErrorKind::Trap.http_status(), 500);
        assert_eq!(ErrorKind::Invariant.http_status(), 500);
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(ErrorKind::Run.is_recoverable());
        assert!(ErrorKind::Trap.is_recoverable());
        assert!(!ErrorKind::NotFound.is_recoverable());
        assert!(!ErrorKind::Timeout.is_recoverable());
        assert!(!ErrorKind::Access.is_recoverable());
    }

    #[test]
    fn test_host_call_error_conversion() {
        let err: FabricError = HostCallError::HostCallInProgress.into();
        assert!(matches!(err, FabricError::HostCallInProgress));

        let err: FabricError = HostCallError::PermissionDenied {
            resource: "HTTP access".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn test_is_not_found() {
        assert!(FabricError::not_found("x").is_not_found());
        assert!(!FabricError::NoResult.is_not_found());
    }
}
