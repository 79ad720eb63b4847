//! Agent directory discovery and dependency declaration scanning.
//!
//! Layout convention: `agent/` holds the root agent, `agent-<name>/` holds a
//! named sibling. Each may carry a `requirements.txt`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::requirements::{Requirement, parse_requirements};
use crate::core::types::{AgentDescriptor, ROOT_AGENT_NAME, module_path_for};
use crate::error::DiscoveryError;
use crate::io::events::{EventSink, Level, StageEvents};

pub const REQUIREMENTS_FILE: &str = "requirements.txt";

static AGENT_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^agent(?:-([a-z0-9][a-z0-9_-]*))?$").unwrap());

/// Everything discovered in a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Agents sorted by name. `source_dir` is absolute.
    pub agents: Vec<AgentDescriptor>,
    pub root_agent: String,
    /// Raw declarations in agent order, then file order.
    pub requirements: Vec<Requirement>,
    /// Distinct requested package names, bootstrap set included.
    pub requested: BTreeSet<String>,
}

/// Agent name for a directory name, if it follows the convention.
pub fn agent_name_for_dir(dir_name: &str) -> Option<String> {
    let captures = AGENT_DIR_RE.captures(dir_name)?;
    match captures.get(1) {
        Some(name) => Some(name.as_str().to_string()),
        None => Some(ROOT_AGENT_NAME.to_string()),
    }
}

/// Scan `root` for agent directories and their declared requirements.
///
/// `bootstrap` names are always added to the requested set so the installer can
/// run offline.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn discover(root: &Path, bootstrap: &[String], sink: &dyn EventSink) -> Result<Discovery> {
    let events = StageEvents::new(sink, "discover");
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("read workspace {}", root.display()))? {
        let entry = entry.context("read workspace entry")?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let dir_name = entry.file_name();
        let Some(dir_name) = dir_name.to_str() else {
            continue;
        };
        let Some(name) = agent_name_for_dir(dir_name) else {
            continue;
        };
        if name == ROOT_AGENT_NAME && dir_name != "agent" {
            return Err(DiscoveryError::ReservedName {
                dir: dir_name.to_string(),
                name,
            }
            .into());
        }
        found.push((name, path));
    }
    found.sort_by(|left, right| left.0.cmp(&right.0));

    if found.is_empty() {
        events.emit(events.record(Level::Error, "no_agents").field("root", root.display().to_string()));
        return Err(DiscoveryError::NoAgents {
            root: root.to_path_buf(),
        }
        .into());
    }
    if !found.iter().any(|(name, _)| name == ROOT_AGENT_NAME) {
        let names: Vec<String> = found.iter().map(|(name, _)| name.clone()).collect();
        events.emit(
            events
                .record(Level::Error, "missing_root_agent")
                .field("found", names.clone()),
        );
        return Err(DiscoveryError::MissingRoot {
            root: root.to_path_buf(),
            found: names,
        }
        .into());
    }

    let mut agents = Vec::with_capacity(found.len());
    let mut requirements = Vec::new();
    for (name, path) in found {
        let declared = read_requirements(&name, &path)?;
        debug!(agent = %name, count = declared.len(), "requirements parsed");
        events.emit(
            events
                .record(Level::Info, "agent_discovered")
                .field("agent", name.clone())
                .field("requirements", declared.len()),
        );
        requirements.extend(declared);
        agents.push(AgentDescriptor {
            module_path: module_path_for(&name),
            source_dir: path.display().to_string(),
            name,
        });
    }

    let mut requested: BTreeSet<String> = requirements.iter().map(|r| r.name.clone()).collect();
    requested.extend(bootstrap.iter().cloned());
    events.emit(
        events
            .record(Level::Info, "requirements_collected")
            .field("agents", agents.len())
            .field("requested", requested.iter().cloned().collect::<Vec<_>>()),
    );

    Ok(Discovery {
        agents,
        root_agent: ROOT_AGENT_NAME.to_string(),
        requirements,
        requested,
    })
}

fn read_requirements(agent: &str, dir: &Path) -> Result<Vec<Requirement>> {
    let path = dir.join(REQUIREMENTS_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    parse_requirements(agent, &contents).map_err(|err| anyhow!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::events::TracingEventSink;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write");
    }

    fn bootstrap() -> Vec<String> {
        vec!["micropip".to_string(), "packaging".to_string()]
    }

    #[test]
    fn maps_directory_names_to_agent_names() {
        assert_eq!(agent_name_for_dir("agent"), Some("root".to_string()));
        assert_eq!(
            agent_name_for_dir("agent-multiplier"),
            Some("multiplier".to_string())
        );
        assert_eq!(agent_name_for_dir("agents"), None);
        assert_eq!(agent_name_for_dir("agent-"), None);
        assert_eq!(agent_name_for_dir("agent-Upper"), None);
        assert_eq!(agent_name_for_dir("my-agent"), None);
    }

    #[test]
    fn collects_requirements_and_bootstrap_set() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write(&root.join("agent/main.py"), "");
        write(&root.join("agent/requirements.txt"), "numpy>=1.26\n# comment\n");
        write(&root.join("agent-multiplier/main.py"), "");
        write(
            &root.join("agent-multiplier/requirements.txt"),
            "NumPy\nrequests==2.31\n",
        );
        write(&root.join("agent-empty/main.py"), "");
        write(&root.join("docs/readme.md"), "");

        let found = discover(root, &bootstrap(), &TracingEventSink).expect("discover");
        let names: Vec<&str> = found.agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["empty", "multiplier", "root"]);
        assert_eq!(found.root_agent, "root");
        assert_eq!(found.requirements.len(), 3);
        assert_eq!(
            found.requested.into_iter().collect::<Vec<_>>(),
            vec!["micropip", "numpy", "packaging", "requests"]
        );
        let multiplier = &found.agents[1];
        assert_eq!(multiplier.module_path, "agents.multiplier.main");
    }

    #[test]
    fn empty_workspace_is_a_discovery_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = discover(temp.path(), &bootstrap(), &TracingEventSink).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiscoveryError>(),
            Some(DiscoveryError::NoAgents { .. })
        ));
    }

    #[test]
    fn siblings_without_root_are_a_discovery_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp.path().join("agent-multiplier/main.py"), "");
        let err = discover(temp.path(), &bootstrap(), &TracingEventSink).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DiscoveryError>(),
            Some(DiscoveryError::MissingRoot { .. })
        ));
    }

    #[test]
    fn reserved_root_name_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(&temp.path().join("agent/main.py"), "");
        write(&temp.path().join("agent-root/main.py"), "");
        let err = discover(temp.path(), &bootstrap(), &TracingEventSink).unwrap_err();
        match err.downcast_ref::<DiscoveryError>() {
            Some(DiscoveryError::ReservedName { dir, name }) => {
                assert_eq!(dir, "agent-root");
                assert_eq!(name, "root");
            }
            other => panic!("expected reserved name error, got {other:?}"),
        }
    }
}
