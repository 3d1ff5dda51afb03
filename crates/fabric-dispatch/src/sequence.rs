//! Ordered execution of workflow steps over a shared state map.
//!
//! Each completed step writes its output to `state[key]`, where the key is
//! the step's alias or, failing that, its `fqmn` as written. Response
//! headers produced by steps accumulate on the request. A group step runs
//! its members in parallel and completes once every member has a result.
//!
//! A step with a `with` clause sees a desired state instead of the full
//! state: every aliased source is copied under its alias, and every state
//! entry that is not an aliased source is copied unchanged. A source key
//! that is not itself a state key may name the module of an FQMN-keyed
//! entry.
//!
//! `on_err` applies only to run errors and traps; every other failure ends
//! the sequence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fabric_common::{
    CoordinatedRequest, ErrorKind, ExecOutcome, ExecRequest, ExecResult, ExecutableStep,
    FabricError, Fqmn, OnErr, ResponseHeaders, Step, WorkflowDef,
};

use crate::dispatcher::DEFAULT_TIMEOUT;
use crate::executor::Executor;

/// Why a sequence stopped.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// A `with` source was absent from state.
    #[error("desired state not generated for step '{step}': missing '{source_key}'")]
    DesiredStateNotGenerated {
        /// The step's state key.
        step: String,
        /// The missing source.
        source_key: String,
    },

    /// A step failed and its policy said to stop.
    #[error("step '{step}' failed")]
    StepFailed {
        /// The step's state key.
        step: String,
        /// The failing result.
        result: ExecResult,
    },

    /// A step could not be turned into a job.
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

impl SequenceError {
    /// Fold into an [`ExecResult`] reported under `fqmn`.
    pub fn into_exec_result(self, fqmn: &str) -> ExecResult {
        let message = self.to_string();
        match self {
            Self::StepFailed { result, .. } => ExecResult {
                fqmn: fqmn.to_string(),
                outcome: result.outcome,
            },
            Self::DesiredStateNotGenerated { .. } => {
                ExecResult::exec_err(fqmn, ErrorKind::Invariant, message)
            }
            Self::Fabric(e) => ExecResult::from_error(fqmn, e),
        }
    }
}

/// What a completed sequence produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceOutput {
    /// State entry of the last step.
    pub output: Vec<u8>,
    /// Headers accumulated across every step.
    pub resp_headers: ResponseHeaders,
    /// Final state.
    pub state: BTreeMap<String, Vec<u8>>,
}

/// One run of a workflow.
#[derive(Debug)]
pub struct Sequence {
    executor: Arc<dyn Executor>,
    tenant: String,
    namespace: String,
    steps: Vec<Step>,
    request: CoordinatedRequest,
    step_timeout: Duration,
}

impl Sequence {
    /// Prepare `workflow` against `request`. Bare step names resolve within
    /// the workflow's tenant and namespace.
    pub fn new(
        executor: Arc<dyn Executor>,
        workflow: &WorkflowDef,
        request: CoordinatedRequest,
    ) -> Self {
        Self {
            executor,
            tenant: workflow.tenant.clone(),
            namespace: workflow.namespace.clone(),
            steps: workflow.steps.clone(),
            request,
            step_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for each step.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Run every step in order.
    #[instrument(skip_all, fields(tenant = %self.tenant, namespace = %self.namespace, steps = self.steps.len()))]
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<SequenceOutput, SequenceError> {
        let steps = std::mem::take(&mut self.steps);
        let mut last_key = None;

        for (i, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(FabricError::canceled("sequence").into());
            }
            self.request.sequence_json = Some(remaining_json(&steps[i..])?);
            self.run_step(step, cancel).await?;
            last_key = step.members().last().map(|m| m.state_key().to_string());
        }

        let output = last_key
            .and_then(|key| self.request.state.get(&key).cloned())
            .unwrap_or_default();
        info!(state_entries = self.request.state.len(), "Sequence completed");
        Ok(SequenceOutput {
            output,
            resp_headers: self.request.resp_headers,
            state: self.request.state,
        })
    }

    async fn run_step(&mut self, step: &Step, cancel: &CancellationToken) -> Result<(), SequenceError> {
        let jobs = step
            .members()
            .iter()
            .map(|member| Ok((member, self.job_for(member)?)))
            .collect::<Result<Vec<_>, SequenceError>>()?;

        let results = futures::future::join_all(jobs.into_iter().map(|(member, job)| {
            let executor = Arc::clone(&self.executor);
            let cancel = cancel.child_token();
            async move { (member, executor.exec(job, cancel).await) }
        }))
        .await;

        let mut failure = None;
        for (member, result) in results {
            let key = member.state_key().to_string();
            let kind = result.error_kind();
            let continue_on_err = should_continue(member, &result);
            match result.outcome {
                ExecOutcome::Response(response) => {
                    debug!(step = %key, output_len = response.output.len(), "Step completed");
                    self.request.resp_headers.merge(&response.resp_headers);
                    self.request.state.insert(key, response.output);
                }
                _ if continue_on_err => {
                    warn!(step = %key, ?kind, "Step failed, continuing");
                }
                outcome => {
                    warn!(step = %key, ?kind, "Step failed, stopping");
                    if failure.is_none() {
                        let result = ExecResult {
                            fqmn: result.fqmn,
                            outcome,
                        };
                        failure = Some(SequenceError::StepFailed { step: key, result });
                    }
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn job_for(&self, step: &ExecutableStep) -> Result<ExecRequest, SequenceError> {
        let target = step
            .target(&self.tenant, &self.namespace)
            .map_err(FabricError::from)?;
        let mut request = self.request.clone();
        request.state = desired_state(step, &self.request.state)?;
        request.resp_headers = ResponseHeaders::new();

        let timeout_ms = u64::try_from(self.step_timeout.as_millis()).unwrap_or(u64::MAX);
        Ok(ExecRequest::new(target, request).with_timeout_ms(timeout_ms))
    }
}

/// JSON of the steps still to run, starting with the current one.
fn remaining_json(steps: &[Step]) -> Result<String, FabricError> {
    serde_json::to_string(steps)
        .map_err(|e| FabricError::invariant(format!("cannot encode remaining steps: {e}")))
}

fn should_continue(step: &ExecutableStep, result: &ExecResult) -> bool {
    match &result.outcome {
        ExecOutcome::RunErr(run) => step.on_err_action(Some(run.code)) == OnErr::Continue,
        ExecOutcome::ExecErr(e) if e.kind == ErrorKind::Trap => {
            step.on_err_action(None) == OnErr::Continue
        }
        _ => false,
    }
}

/// The state `step` should see.
pub fn desired_state(
    step: &ExecutableStep,
    state: &BTreeMap<String, Vec<u8>>,
) -> Result<BTreeMap<String, Vec<u8>>, SequenceError> {
    if step.with.is_empty() {
        return Ok(state.clone());
    }

    let mut desired = BTreeMap::new();
    let mut sources = Vec::with_capacity(step.with.len());
    for (alias, source) in &step.with {
        let (key, value) = lookup(state, source).ok_or_else(|| {
            SequenceError::DesiredStateNotGenerated {
                step: step.state_key().to_string(),
                source_key: source.clone(),
            }
        })?;
        sources.push(key);
        desired.insert(alias.clone(), value.clone());
    }

    for (key, value) in state {
        if !sources.contains(&key.as_str()) {
            desired.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    Ok(desired)
}

fn lookup<'a>(state: &'a BTreeMap<String, Vec<u8>>, source: &str) -> Option<(&'a str, &'a Vec<u8>)> {
    if let Some((key, value)) = state.get_key_value(source) {
        return Some((key.as_str(), value));
    }
    state
        .iter()
        .find(|(key, _)| Fqmn::parse(key).is_ok_and(|fqmn| fqmn.name == source))
        .map(|(key, value)| (key.as_str(), value))
}
