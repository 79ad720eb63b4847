//! Shared deterministic types for agent discovery and orchestration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name reserved for the workflow entry agent (`agent/` directory).
pub const ROOT_AGENT_NAME: &str = "root";

/// Module path convention for an agent name.
pub fn module_path_for(name: &str) -> String {
    format!("agents.{name}.main")
}

/// A discovered task unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub name: String,
    /// Directory of the agent sources. Absolute at discovery time, relative to
    /// the code tree once written into a registry.
    pub source_dir: String,
    pub module_path: String,
}

/// Authoritative name → module mapping shipped with the code artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistry {
    pub agents: Vec<AgentDescriptor>,
    pub root_agent: String,
}

impl AgentRegistry {
    pub fn get(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|agent| agent.name == name)
    }

    /// Semantic checks: unique names, root present, non-empty module paths.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                errors.push(format!("duplicate agent name '{}'", agent.name));
            }
            if agent.module_path.trim().is_empty() {
                errors.push(format!("agent '{}' has empty modulePath", agent.name));
            }
        }
        if self.get(&self.root_agent).is_none() {
            errors.push(format!(
                "root agent '{}' is not listed in agents",
                self.root_agent
            ));
        }
        errors
    }
}

/// One unit of work handed to the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTask {
    pub agent_name: String,
    pub input: Value,
    pub config: Value,
}
