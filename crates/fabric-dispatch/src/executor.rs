//! The seam between the sequencer and whatever runs a single job.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fabric_common::{ExecRequest, ExecResult};

/// Runs one job and reports its outcome.
///
/// Failures are part of the [`ExecResult`], never a panic or a separate
/// error channel, so in-process and remote executors are interchangeable.
#[async_trait]
pub trait Executor: Send + Sync + Debug {
    /// Execute `job`, abandoning it when `cancel` fires.
    async fn exec(&self, job: ExecRequest, cancel: CancellationToken) -> ExecResult;
}
