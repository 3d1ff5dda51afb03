//! Core Wasmtime runtime for the fabric.
//!
//! This crate provides the WebAssembly execution machinery:
//! - [`WasmEngine`]: Configured Wasmtime engine with pooling allocator and epoch ticker
//! - [`ModuleRef`] / [`CompiledModule`]: Content-addressed bytes and their compiled form
//! - [`Instance`]: One live instance with its store, memory and result channels
//! - [`IdentifierRegistry`]: Binds call identifiers to in-flight calls
//! - [`HostRegistry`]: Host functions linked into every instance
//! - [`InstancePool`] / [`PoolSet`]: Warm instances per module
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared across all pools, thread-safe)                 │
//! │  - Pooling Allocator                                    │
//! │  - Epoch ticker                                         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              PoolSet  (canonical FQMN → pool)           │
//! │  - Compiles each module once                            │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │      InstancePool  (bounded queue of idle Instances)    │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Instance  (Store<InstanceState>)               │
//! │  - Linear memory                                        │
//! │  - Per-call CallContext, reachable by identifier        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod ident;
pub mod instance;
pub mod module;
pub mod pool;
pub mod pools;
pub mod registry;
pub mod store;

pub use engine::WasmEngine;
pub use ident::{IdentGuard, IdentifierRegistry};
pub use instance::{CallError, CallOutcome, Instance};
pub use module::{CompiledModule, ModuleRef, content_ref};
pub use pool::{InstanceFactory, InstancePool, Outcome, PoolStats, PooledInstance};
pub use pools::PoolSet;
pub use registry::{HOST_MODULE, HostCall, HostFn, HostRegistry, Returns, SWIFT_SUFFIX, complete, reject};
pub use store::{CallContext, FfiVar, InstanceState, LogEntry, LogLevel};
