//! Tape contract between the engine and a sandboxed agent.
//!
//! The input tape is `{trace_id, payload}`. The output tape must echo the
//! trace id and declare either `complete` (with `result`) or `pending` (with a
//! `run_agent` action and an explicit numeric `progress`).

use std::sync::LazyLock;

use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::WorkflowTask;

const OUTPUT_TAPE_SCHEMA: &str = include_str!("../../schemas/output_tape.schema.json");

static OUTPUT_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(OUTPUT_TAPE_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

/// Document written to the input tape before each invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputTape {
    pub trace_id: String,
    pub payload: Value,
}

/// Interpreted, validated output tape.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    Complete {
        result: Value,
        progress: Option<f64>,
    },
    Pending {
        progress: f64,
        next: WorkflowTask,
    },
}

/// Compare the echoed trace id with the one sent.
///
/// Returns the received id (if any) on mismatch.
pub fn check_trace(output: &Value, expected: &str) -> Result<(), Option<String>> {
    match output.get("trace_id").and_then(Value::as_str) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(Some(actual.to_string())),
        None => Err(None),
    }
}

/// Validate an output tape against the schema, then interpret it.
pub fn interpret_output(output: &Value) -> Result<StepResponse, String> {
    let validator = OUTPUT_VALIDATOR
        .as_ref()
        .map_err(|err| format!("invalid output tape schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(output)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!(
            "output tape failed schema validation: {}",
            messages.join("; ")
        ));
    }

    let progress = output.get("progress").and_then(Value::as_f64);
    match output.get("status").and_then(Value::as_str) {
        Some("complete") => Ok(StepResponse::Complete {
            result: output.get("result").cloned().unwrap_or(Value::Null),
            progress,
        }),
        Some("pending") => {
            let progress = progress.ok_or_else(|| "pending response without progress".to_string())?;
            let payload = output
                .pointer("/action/payload")
                .ok_or_else(|| "pending response without action payload".to_string())?;
            let agent_name = payload
                .get("agent_name")
                .and_then(Value::as_str)
                .ok_or_else(|| "action payload without agent_name".to_string())?;
            let config = payload
                .get("agent_config")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            Ok(StepResponse::Pending {
                progress,
                next: WorkflowTask {
                    agent_name: agent_name.to_string(),
                    input: payload.get("input_data").cloned().unwrap_or(Value::Null),
                    config,
                },
            })
        }
        other => Err(format!("unknown status {other:?}")),
    }
}
