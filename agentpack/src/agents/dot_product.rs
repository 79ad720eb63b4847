//! Root agent: dot product of the configured vector with the input vector.
//!
//! Config: `vector` (default `[1, 2, 3]`), optional `target_threshold`,
//! optional `delegate_to` (default `multiplier`), optional `collect_result`.
//!
//! Below the threshold the agent delegates the dot product to another agent,
//! reporting it as progress. With `collect_result` the delegate is asked to
//! hand its result back, which then arrives here as `processed_result`.

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use super::{Agent, AgentOutput, number_array};
use crate::core::types::ROOT_AGENT_NAME;
use crate::io::sandbox::HostCapabilities;

const DEFAULT_VECTOR: [f64; 3] = [1.0, 2.0, 3.0];

pub struct DotProductAgent;

impl Agent for DotProductAgent {
    fn run(&self, input: &Value, config: &Value, host: &dyn HostCapabilities) -> Result<AgentOutput> {
        if let Some(processed) = input.get("processed_result") {
            host.log(ROOT_AGENT_NAME, &format!("received processed result {processed}"));
            return Ok(AgentOutput::Complete {
                result: processed.clone(),
            });
        }

        let weights = number_array(config, "vector").unwrap_or_else(|| DEFAULT_VECTOR.to_vec());
        let values = number_array(input, "vector")
            .ok_or_else(|| anyhow!("input must carry a numeric `vector`"))?;
        if weights.len() != values.len() {
            return Err(anyhow!(
                "vector length mismatch: config has {}, input has {}",
                weights.len(),
                values.len()
            ));
        }
        let dot: f64 = weights.iter().zip(&values).map(|(w, v)| w * v).sum();
        host.log(ROOT_AGENT_NAME, &format!("dot product {dot}"));

        let threshold = config.get("target_threshold").and_then(Value::as_f64);
        match threshold {
            Some(threshold) if dot < threshold => {
                let delegate = config
                    .get("delegate_to")
                    .and_then(Value::as_str)
                    .unwrap_or(super::multiplier::AGENT_NAME);
                let mut next_input = json!({"number": dot});
                if config.get("collect_result").and_then(Value::as_bool) == Some(true) {
                    next_input["return_to"] = json!(ROOT_AGENT_NAME);
                    next_input["original_payload"] = input.clone();
                }
                Ok(AgentOutput::Delegate {
                    progress: dot,
                    agent_name: delegate.to_string(),
                    input: next_input,
                    config: None,
                })
            }
            _ => Ok(AgentOutput::Complete { result: json!(dot) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sandbox::{HostInfo, TracingHost};

    fn host() -> TracingHost {
        TracingHost::new(HostInfo::default())
    }

    #[test]
    fn below_threshold_delegates_to_multiplier() {
        let output = DotProductAgent
            .run(
                &json!({"vector": [2, 4, 6]}),
                &json!({"vector": [1, 1, 1], "target_threshold": 100}),
                &host(),
            )
            .expect("run");
        assert_eq!(
            output,
            AgentOutput::Delegate {
                progress: 12.0,
                agent_name: "multiplier".to_string(),
                input: json!({"number": 12.0}),
                config: None,
            }
        );
    }

    #[test]
    fn without_threshold_completes_with_dot_product() {
        let output = DotProductAgent
            .run(&json!({"vector": [1, 1, 1]}), &json!({}), &host())
            .expect("run");
        assert_eq!(output, AgentOutput::Complete { result: json!(6.0) });
    }

    #[test]
    fn collect_result_asks_for_the_value_back() {
        let input = json!({"vector": [1, 0, 0]});
        let output = DotProductAgent
            .run(
                &input,
                &json!({"vector": [5, 0, 0], "target_threshold": 10, "collect_result": true}),
                &host(),
            )
            .expect("run");
        let AgentOutput::Delegate { input: next, .. } = output else {
            panic!("expected delegate");
        };
        assert_eq!(next["return_to"], "root");
        assert_eq!(next["original_payload"], input);

        let done = DotProductAgent
            .run(&json!({"processed_result": 10.0}), &json!({}), &host())
            .expect("run");
        assert_eq!(done, AgentOutput::Complete { result: json!(10.0) });
    }

    #[test]
    fn mismatched_lengths_fail() {
        let err = DotProductAgent
            .run(&json!({"vector": [1, 2]}), &json!({"vector": [1, 2, 3]}), &host())
            .unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }
}
