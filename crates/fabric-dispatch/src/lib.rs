//! Job dispatch and workflow sequencing.
//!
//! - [`Executor`]: runs one [`ExecRequest`](fabric_common::ExecRequest)
//! - [`Dispatcher`]: the in-process executor over local instance pools
//! - [`RemoteExecutor`]: forwards jobs to a peer node
//! - [`Sequence`]: runs a workflow's steps against any executor
//! - [`WorkflowRegistry`]: finds workflows by name

pub mod dispatcher;
pub mod executor;
pub mod remote;
pub mod sequence;
pub mod workflows;

pub use dispatcher::{DEFAULT_TIMEOUT, Dispatcher};
pub use executor::Executor;
pub use remote::RemoteExecutor;
pub use sequence::{Sequence, SequenceError, SequenceOutput, desired_state};
pub use workflows::WorkflowRegistry;
