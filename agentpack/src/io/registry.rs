//! `registry.json` persistence.

use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::types::AgentRegistry;
use crate::io::manifest::{read_json, write_json};

pub const REGISTRY_FILE: &str = "registry.json";

pub fn write_registry(path: &Path, registry: &AgentRegistry) -> Result<()> {
    ensure_valid(registry, path)?;
    write_json(path, registry)
}

/// Load and validate a registry. Duplicate names or an unlisted root agent
/// are rejected.
pub fn load_registry(path: &Path) -> Result<AgentRegistry> {
    let registry: AgentRegistry = read_json(path)?;
    ensure_valid(&registry, path)?;
    Ok(registry)
}

fn ensure_valid(registry: &AgentRegistry, path: &Path) -> Result<()> {
    let errors = registry.validate();
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "invalid agent registry {}: {}",
        path.display(),
        errors.join("; ")
    ))
}
