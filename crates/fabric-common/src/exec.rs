//! Execution job and result schema.
//!
//! [`ExecRequest`] and [`ExecResult`] are the single schema shared by the
//! in-process dispatcher and the remote executor; both serialize to JSON for
//! the `/exec` endpoint.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ErrorKind, FabricError};
use crate::fqmn::{Fqmn, ModuleName};
use crate::request::{CoordinatedRequest, ResponseHeaders};

/// A structured error a guest raised via `return_error` or `return_abort`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("run error {code}: {message}")]
pub struct RunError {
    /// Guest-chosen error code, usually an HTTP status.
    pub code: i32,
    /// Guest-supplied message.
    pub message: String,
}

impl RunError {
    /// Create a new run error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// HTTP status for this error: the code itself if within `[200, 599]`,
    /// otherwise `500`.
    pub fn http_status(&self) -> u16 {
        u16::try_from(self.code)
            .ok()
            .filter(|code| (200..=599).contains(code))
            .unwrap_or(500)
    }
}

/// What a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ExecTarget {
    /// The latest revision of a named module.
    Name {
        /// Tenant identifier.
        tenant: String,
        /// Namespace within the tenant.
        namespace: String,
        /// Module name within the namespace.
        name: String,
    },
    /// A revision addressed by its content ref alone.
    Ref {
        /// Hex SHA-256 of the module bytes.
        module_ref: String,
    },
    /// An exact revision.
    Fqmn {
        /// Fully-qualified module name.
        fqmn: Fqmn,
    },
}

impl std::fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Name {
                tenant,
                namespace,
                name,
            } => write!(f, "{tenant}/{namespace}/{name}"),
            Self::Ref { module_ref } => write!(f, "ref:{module_ref}"),
            Self::Fqmn { fqmn } => write!(f, "{fqmn}"),
        }
    }
}

impl ExecTarget {
    /// Target the latest revision of `module`.
    pub fn name(module: &ModuleName) -> Self {
        Self::Name {
            tenant: module.tenant.clone(),
            namespace: module.namespace.clone(),
            name: module.name.clone(),
        }
    }
}

/// A job submitted to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Module to run.
    pub target: ExecTarget,
    /// Request envelope bound to the call.
    pub request: CoordinatedRequest,
    /// Per-call deadline; the executor default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecRequest {
    /// Create a job with the executor's default deadline.
    pub fn new(target: ExecTarget, request: CoordinatedRequest) -> Self {
        Self {
            target,
            request,
            timeout_ms: None,
        }
    }

    /// Override the per-call deadline.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Successful guest output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    /// Bytes published through `return_result`.
    #[serde(with = "crate::b64")]
    pub output: Vec<u8>,
    /// Response headers set through `resp_set_header`.
    #[serde(default)]
    pub resp_headers: ResponseHeaders,
}

/// A failure that did not come from the guest's own error channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

/// The single outcome of an execution.
///
/// Modelled as an enum so exactly one of response, run error or execution
/// error is ever populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutcome {
    /// The guest called `return_result`.
    Response(ExecResponse),
    /// The guest called `return_error` or `return_abort`.
    RunErr(RunError),
    /// The execution failed before the guest could report.
    ExecErr(ExecError),
}

/// Result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Canonical FQMN (or target description) of what was run.
    pub fqmn: String,
    /// What happened.
    #[serde(flatten)]
    pub outcome: ExecOutcome,
}

impl ExecResult {
    /// A successful result.
    pub fn response(
        fqmn: impl Into<String>,
        output: Vec<u8>,
        resp_headers: ResponseHeaders,
    ) -> Self {
        Self {
            fqmn: fqmn.into(),
            outcome: ExecOutcome::Response(ExecResponse {
                output,
                resp_headers,
            }),
        }
    }

    /// A guest-reported error.
    pub fn run_err(fqmn: impl Into<String>, err: RunError) -> Self {
        Self {
            fqmn: fqmn.into(),
            outcome: ExecOutcome::RunErr(err),
        }
    }

    /// An execution failure.
    pub fn exec_err(fqmn: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            fqmn: fqmn.into(),
            outcome: ExecOutcome::ExecErr(ExecError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Build a result from a fabric error, keeping guest errors as `run_err`.
    pub fn from_error(fqmn: impl Into<String>, err: FabricError) -> Self {
        match err {
            FabricError::Run(run) => Self::run_err(fqmn, run),
            other => Self::exec_err(fqmn, other.kind(), other.to_string()),
        }
    }

    /// Returns `true` if the guest produced a response.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecOutcome::Response(_))
    }

    /// The failure kind, or `None` on success.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ExecOutcome::Response(_) => None,
            ExecOutcome::RunErr(_) => Some(ErrorKind::Run),
            ExecOutcome::ExecErr(e) => Some(e.kind),
        }
    }

    /// HTTP status this result maps to.
    pub fn http_status(&self) -> u16 {
        match &self.outcome {
            ExecOutcome::Response(_) => 200,
            ExecOutcome::RunErr(e) => e.http_status(),
            ExecOutcome::ExecErr(e) => e.kind.http_status(),
        }
    }

    /// Convert into the guest output, or the error that replaced it.
    pub fn into_response(self) -> Result<ExecResponse, FabricError> {
        match self.outcome {
            ExecOutcome::Response(resp) => Ok(resp),
            ExecOutcome::RunErr(e) => Err(FabricError::Run(e)),
            ExecOutcome::ExecErr(e) => Err(exec_error_to_fabric(e)),
        }
    }
}

fn exec_error_to_fabric(e: ExecError) -> FabricError {
    match e.kind {
        ErrorKind::Access => FabricError::access(e.message),
        ErrorKind::Forbidden => FabricError::forbidden(e.message),
        ErrorKind::NotFound => FabricError::not_found(e.message),
        ErrorKind::Trap => FabricError::trap(e.message),
        ErrorKind::Timeout => FabricError::timeout(e.message, 0),
        ErrorKind::Canceled => FabricError::canceled(e.message),
        ErrorKind::HostCallInProgress => FabricError::HostCallInProgress,
        ErrorKind::Transient => FabricError::transient(e.message),
        ErrorKind::NoResult => FabricError::NoResult,
        ErrorKind::BadRequest => FabricError::bad_request(e.message),
        ErrorKind::Run | ErrorKind::Invariant | ErrorKind::Internal => {
            FabricError::invariant(e.message)
        }
    }
}
