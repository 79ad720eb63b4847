//! Native agents runnable by the reference sandbox.
//!
//! An agent receives the input tape payload and its config and answers with
//! an [`AgentOutput`]; the sandbox turns that into the output tape.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::types::{ROOT_AGENT_NAME, module_path_for};
use crate::io::sandbox::HostCapabilities;

pub mod dot_product;
pub mod multiplier;

pub use dot_product::DotProductAgent;
pub use multiplier::MultiplierAgent;

/// Business logic of one agent.
pub trait Agent: Send + Sync {
    fn run(&self, input: &Value, config: &Value, host: &dyn HostCapabilities) -> Result<AgentOutput>;
}

/// What an agent decided for this step.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Complete {
        result: Value,
    },
    /// Hand control to another agent.
    Delegate {
        progress: f64,
        agent_name: String,
        input: Value,
        config: Option<Value>,
    },
}

impl AgentOutput {
    /// Output tape document echoing `trace_id`.
    pub fn to_tape(&self, trace_id: &str) -> Value {
        match self {
            AgentOutput::Complete { result } => json!({
                "trace_id": trace_id,
                "status": "complete",
                "result": result,
            }),
            AgentOutput::Delegate {
                progress,
                agent_name,
                input,
                config,
            } => {
                let mut payload = json!({
                    "agent_name": agent_name,
                    "input_data": input,
                });
                if let Some(config) = config {
                    payload["agent_config"] = config.clone();
                }
                json!({
                    "trace_id": trace_id,
                    "status": "pending",
                    "progress": progress,
                    "action": {"type": "run_agent", "payload": payload},
                })
            }
        }
    }
}

/// Module path → agent implementation.
#[derive(Default, Clone)]
pub struct ModuleTable {
    modules: BTreeMap<String, Arc<dyn Agent>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the agents shipped in this crate: `root` (dot product) and
    /// `multiplier`.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register(&module_path_for(ROOT_AGENT_NAME), DotProductAgent);
        table.register(&module_path_for(multiplier::AGENT_NAME), MultiplierAgent);
        table
    }

    pub fn register(&mut self, module_path: &str, agent: impl Agent + 'static) {
        self.modules.insert(module_path.to_string(), Arc::new(agent));
    }

    pub fn get(&self, module_path: &str) -> Option<Arc<dyn Agent>> {
        self.modules.get(module_path).cloned()
    }

    pub fn module_paths(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.modules.keys()).finish()
    }
}

/// Numeric array field of a JSON object.
pub(crate) fn number_array(value: &Value, key: &str) -> Option<Vec<f64>> {
    value
        .get(key)?
        .as_array()?
        .iter()
        .map(Value::as_f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{StepResponse, interpret_output};

    #[test]
    fn delegate_tape_passes_protocol_validation() {
        let output = AgentOutput::Delegate {
            progress: 12.0,
            agent_name: "multiplier".to_string(),
            input: json!({"number": 12.0}),
            config: None,
        };
        let tape = output.to_tape("trace-1");
        let StepResponse::Pending { progress, next } = interpret_output(&tape).expect("valid")
        else {
            panic!("expected pending");
        };
        assert_eq!(progress, 12.0);
        assert_eq!(next.agent_name, "multiplier");
        assert_eq!(next.config, json!({}));
    }

    #[test]
    fn builtin_table_lists_both_agents() {
        let table = ModuleTable::builtin();
        let paths: Vec<&str> = table.module_paths().collect();
        assert_eq!(paths, vec!["agents.multiplier.main", "agents.root.main"]);
    }
}
