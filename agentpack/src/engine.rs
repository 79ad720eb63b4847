//! Orchestration engine: drives a chain of agent invocations inside one sandbox.
//!
//! Each step writes a fresh trace id and the task payload to the input tape,
//! invokes the agent's module, and reads the output tape back. The response
//! is checked in this order: trace id, schema, interpretation, then the
//! stagnation and step bounds applied by [`WorkflowMachine`].

use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::core::protocol::{InputTape, StepResponse, check_trace, interpret_output};
use crate::core::types::WorkflowTask;
use crate::core::workflow::{AbortReason, Limits, StepRecord, StepStatus, WorkflowMachine, WorkflowState};
use crate::error::{
    InvalidResponseError, ProtocolError, StepTimeoutError, WorkflowStagnationError,
    WorkflowStepLimitError,
};
use crate::io::events::{EventSink, Level, StageEvents};
use crate::io::sandbox::{INPUT_TAPE_PATH, Invocation, InvokeOutcome, OUTPUT_TAPE_PATH, Sandbox};
use crate::stage::AgentTable;

/// Everything the engine consults while running. No global state.
pub struct EngineContext<'a> {
    pub table: &'a AgentTable,
    pub limits: Limits,
    pub step_timeout: Option<Duration>,
    pub sink: &'a dyn EventSink,
}

/// Terminal state of one run plus its full step history.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub state: WorkflowState,
    pub history: Vec<StepRecord>,
}

impl WorkflowRun {
    pub fn result(&self) -> Option<&Value> {
        match &self.state {
            WorkflowState::Complete { result } => Some(result),
            _ => None,
        }
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.state {
            WorkflowState::Aborted(reason) => Some(reason),
            _ => None,
        }
    }

    /// The result, or the typed error matching the abort reason.
    pub fn into_result(self) -> Result<Value> {
        let history = self.history;
        match self.state {
            WorkflowState::Complete { result } => Ok(result),
            WorkflowState::Aborted(reason) => Err(abort_error(reason, history)),
            other => Err(anyhow!("workflow did not reach a terminal state: {other:?}")),
        }
    }

    pub fn report(&self, run_id: &str) -> RunReport {
        RunReport {
            run_id: run_id.to_string(),
            status: match self.state {
                WorkflowState::Complete { .. } => "complete",
                WorkflowState::Aborted(_) => "aborted",
                _ => "incomplete",
            },
            result: self.result().cloned(),
            abort: self.abort_reason().cloned(),
            history: self.history.clone(),
        }
    }
}

/// Serializable record of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortReason>,
    pub history: Vec<StepRecord>,
}

fn abort_error(reason: AbortReason, history: Vec<StepRecord>) -> anyhow::Error {
    match reason {
        AbortReason::InvalidResponse { step, reason } => {
            InvalidResponseError { step, reason, history }.into()
        }
        AbortReason::UnknownAgent { step, agent } => InvalidResponseError {
            step,
            reason: format!("unknown agent '{agent}'"),
            history,
        }
        .into(),
        AbortReason::TraceMismatch {
            step,
            expected,
            actual,
        } => ProtocolError {
            step,
            expected,
            actual,
            history,
        }
        .into(),
        AbortReason::Stagnant { step, threshold } => WorkflowStagnationError {
            step,
            threshold,
            history,
        }
        .into(),
        AbortReason::StepLimitExceeded { max_steps } => {
            WorkflowStepLimitError { max_steps, history }.into()
        }
        AbortReason::StepTimeout {
            step,
            agent,
            timeout_ms,
        } => StepTimeoutError {
            step,
            agent,
            timeout_ms,
            history,
        }
        .into(),
    }
}

/// Drives one sandbox through workflow runs.
pub struct Engine<'a, S: Sandbox + ?Sized> {
    ctx: EngineContext<'a>,
    sandbox: &'a mut S,
}

impl<'a, S: Sandbox + ?Sized> Engine<'a, S> {
    pub fn new(ctx: EngineContext<'a>, sandbox: &'a mut S) -> Self {
        Self { ctx, sandbox }
    }

    /// Run a fresh workflow seeded with `root_agent`.
    ///
    /// Aborts are returned as a [`WorkflowRun`] in the `Aborted` state; `Err`
    /// is reserved for failures of the sandbox itself.
    #[instrument(skip(self, input, config))]
    pub fn run(&mut self, root_agent: &str, input: Value, config: Value) -> Result<WorkflowRun> {
        let events = StageEvents::new(self.ctx.sink, "engine");
        let mut machine = WorkflowMachine::new(self.ctx.limits);
        machine.start().map_err(|err| anyhow!(err))?;
        events.emit(
            events
                .record(Level::Info, "workflow_started")
                .field("root_agent", root_agent.to_string())
                .field("max_steps", self.ctx.limits.max_steps),
        );

        let mut task = WorkflowTask {
            agent_name: root_agent.to_string(),
            input,
            config,
        };
        while let Some(step) = machine.current_step() {
            if let Some(next) = self.step(&mut machine, step, &task, &events)? {
                task = next;
            }
        }

        let (state, history) = machine.into_parts();
        match &state {
            WorkflowState::Complete { .. } => {
                info!(steps = history.len(), "workflow complete");
                events.emit(
                    events
                        .record(Level::Info, "workflow_complete")
                        .field("steps", history.len()),
                );
            }
            WorkflowState::Aborted(reason) => {
                info!(steps = history.len(), ?reason, "workflow aborted");
                let reason = serde_json::to_value(reason).context("serialize abort reason")?;
                events.emit(
                    events
                        .record(Level::Error, "workflow_aborted")
                        .field("steps", history.len())
                        .field("reason", reason),
                );
            }
            _ => {}
        }
        Ok(WorkflowRun { state, history })
    }

    /// Execute one step. Returns the next task when the run continues.
    fn step(
        &mut self,
        machine: &mut WorkflowMachine,
        step: u32,
        task: &WorkflowTask,
        events: &StageEvents<'_>,
    ) -> Result<Option<WorkflowTask>> {
        let agent = task.agent_name.clone();
        let Some(module) = self.ctx.table.get(&agent) else {
            machine.abort(None, AbortReason::UnknownAgent { step, agent });
            return Ok(None);
        };

        let trace_id = Uuid::new_v4().to_string();
        let tape = InputTape {
            trace_id: trace_id.clone(),
            payload: task.input.clone(),
        };
        let tape = serde_json::to_vec(&tape).context("serialize input tape")?;
        let fs = self.sandbox.fs();
        fs.write_file(INPUT_TAPE_PATH, &tape)?;
        fs.remove_file(OUTPUT_TAPE_PATH)?;
        events.emit(
            events
                .record(Level::Debug, "step_started")
                .field("step", step)
                .field("agent", agent.clone())
                .field("trace_id", trace_id.clone()),
        );

        let started = Instant::now();
        let outcome = self.sandbox.invoke(&Invocation {
            module,
            config: &task.config,
            input_tape: INPUT_TAPE_PATH,
            output_tape: OUTPUT_TAPE_PATH,
            timeout: self.ctx.step_timeout,
        })?;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let record = |status: StepStatus, progress: Option<f64>| StepRecord {
            step,
            agent: agent.clone(),
            trace_id: trace_id.clone(),
            status,
            progress,
            elapsed_ms,
        };

        match outcome {
            InvokeOutcome::Finished => {}
            InvokeOutcome::Failed { reason } => {
                machine.abort(
                    Some(record(StepStatus::Failed, None)),
                    AbortReason::InvalidResponse {
                        step,
                        reason: format!("agent failed: {reason}"),
                    },
                );
                return Ok(None);
            }
            InvokeOutcome::TimedOut { .. } => {
                let timeout_ms = self
                    .ctx
                    .step_timeout
                    .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
                    .unwrap_or_default();
                machine.abort(
                    Some(record(StepStatus::Failed, None)),
                    AbortReason::StepTimeout {
                        step,
                        agent: agent.clone(),
                        timeout_ms,
                    },
                );
                return Ok(None);
            }
        }

        let output = match self.read_output() {
            Ok(output) => output,
            Err(reason) => {
                machine.abort(
                    Some(record(StepStatus::Failed, None)),
                    AbortReason::InvalidResponse { step, reason },
                );
                return Ok(None);
            }
        };
        if let Err(actual) = check_trace(&output, &trace_id) {
            machine.abort(
                Some(record(StepStatus::Failed, None)),
                AbortReason::TraceMismatch {
                    step,
                    expected: trace_id.clone(),
                    actual,
                },
            );
            return Ok(None);
        }

        let response = match interpret_output(&output) {
            Ok(response) => response,
            Err(reason) => {
                machine.abort(
                    Some(record(StepStatus::Failed, None)),
                    AbortReason::InvalidResponse { step, reason },
                );
                return Ok(None);
            }
        };
        debug!(step, agent = %agent, elapsed_ms, "step answered");

        match response {
            StepResponse::Complete { result, progress } => {
                emit_finished(events, step, &agent, "complete", progress);
                machine.complete(record(StepStatus::Complete, progress), result);
                Ok(None)
            }
            StepResponse::Pending { progress, next } => {
                emit_finished(events, step, &agent, "pending", Some(progress));
                if !self.ctx.table.contains(&next.agent_name) {
                    machine.abort(
                        Some(record(StepStatus::Pending, Some(progress))),
                        AbortReason::UnknownAgent {
                            step,
                            agent: next.agent_name,
                        },
                    );
                    return Ok(None);
                }
                machine.pending(record(StepStatus::Pending, Some(progress)), progress);
                Ok(Some(next))
            }
        }
    }

    /// Output tape as JSON, or why it could not be read.
    fn read_output(&mut self) -> std::result::Result<Value, String> {
        let raw = self
            .sandbox
            .fs()
            .read_file(OUTPUT_TAPE_PATH)
            .map_err(|err| format!("read output tape: {err:#}"))?
            .ok_or_else(|| "agent wrote no output tape".to_string())?;
        serde_json::from_slice(&raw).map_err(|err| format!("output tape is not valid JSON: {err}"))
    }
}

fn emit_finished(
    events: &StageEvents<'_>,
    step: u32,
    agent: &str,
    status: &str,
    progress: Option<f64>,
) {
    events.emit(
        events
            .record(Level::Info, "step_finished")
            .field("step", step)
            .field("agent", agent.to_string())
            .field("status", status.to_string())
            .field("progress", progress),
    );
}
