//! Common types, errors, and utilities for the fabric.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures and TOML file loading
//! - Module naming ([`Fqmn`]), the request envelope, and the execution
//!   job/result schema
//! - Workflow declarations
//! - A clock abstraction for TTL caches

pub mod b64;
pub mod clock;
pub mod config;
pub mod config_file;
pub mod error;
pub mod exec;
pub mod fqmn;
pub mod request;
pub mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AuthConfig, CacheCapabilityConfig, CapabilitiesConfig, DatabaseConfig, EngineConfig,
    ExecutionConfig, HttpCapabilityConfig, NamedQuery, PoolConfig, QueryType, RuntimeConfig,
    SecretsConfig, SourceConfig, SourceKind,
};
pub use config_file::{ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{ErrorKind, FabricError, HostCallError};
pub use exec::{ExecError, ExecOutcome, ExecRequest, ExecResponse, ExecResult, ExecTarget, RunError};
pub use fqmn::{Fqmn, FqmnError, ModuleName};
pub use request::{CoordinatedRequest, ResponseHeaders};
pub use workflow::{ErrorPolicy, ExecutableStep, OnErr, Step, WorkflowDef};
