//! Multiplies `number` by `factor` (payload) or `default_factor` (config, 2).
//! An optional `delay_ms` in the config sleeps through the host first.
//!
//! With `return_to` in the payload the product is handed back to that agent as
//! `processed_result`, merged into `original_payload`.

use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value, json};

use super::{Agent, AgentOutput};
use crate::io::sandbox::HostCapabilities;

pub const AGENT_NAME: &str = "multiplier";
const DEFAULT_FACTOR: f64 = 2.0;

pub struct MultiplierAgent;

impl Agent for MultiplierAgent {
    fn run(&self, input: &Value, config: &Value, host: &dyn HostCapabilities) -> Result<AgentOutput> {
        if let Some(delay) = config.get("delay_ms").and_then(Value::as_u64) {
            host.sleep(Duration::from_millis(delay));
        }
        let number = input.get("number").and_then(Value::as_f64).unwrap_or(0.0);
        let factor = input
            .get("factor")
            .and_then(Value::as_f64)
            .or_else(|| config.get("default_factor").and_then(Value::as_f64))
            .unwrap_or(DEFAULT_FACTOR);
        let product = number * factor;
        host.log(AGENT_NAME, &format!("{number} x {factor} = {product}"));

        let Some(return_to) = input.get("return_to").and_then(Value::as_str) else {
            return Ok(AgentOutput::Complete {
                result: json!(product),
            });
        };
        let mut next = match input.get("original_payload") {
            Some(Value::Object(original)) => original.clone(),
            _ => Map::new(),
        };
        next.insert("processed_result".to_string(), json!(product));
        Ok(AgentOutput::Delegate {
            progress: product,
            agent_name: return_to.to_string(),
            input: Value::Object(next),
            config: None,
        })
    }
}
