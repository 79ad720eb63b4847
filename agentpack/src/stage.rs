//! Sandbox staging: verified, unpacked trees → a ready sandbox and agent table.
//!
//! Order: mirror code into `/app`, load the registry and resolve every module
//! once, inject host capabilities, bootstrap pass, general install pass.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::instrument;

use crate::core::requirements::normalize_name;
use crate::core::types::AgentRegistry;
use crate::error::{InstallError, InstallPass};
use crate::io::config::VendorConfig;
use crate::io::events::{EventSink, Level, StageEvents};
use crate::io::manifest::ArchiveManifest;
use crate::io::registry::{REGISTRY_FILE, load_registry};
use crate::io::sandbox::{APP_ROOT, HostCapabilities, ModuleHandle, Sandbox, mirror_tree};
use crate::package::PACKAGES_DIR;

/// Agent name → module resolved in the sandbox. Built once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentTable {
    entries: BTreeMap<String, ModuleHandle>,
}

impl AgentTable {
    pub fn insert(&mut self, name: &str, handle: ModuleHandle) {
        self.entries.insert(name.to_string(), handle);
    }

    pub fn get(&self, name: &str) -> Option<&ModuleHandle> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Registry plus resolved table of a staged sandbox.
#[derive(Debug, Clone)]
pub struct StagedWorkflow {
    pub registry: AgentRegistry,
    pub table: AgentTable,
}

/// Unpacked artifact trees to stage from.
#[derive(Debug, Clone)]
pub struct StageInputs<'a> {
    pub code_dir: &'a Path,
    pub deps_dir: &'a Path,
    pub deps_manifest: &'a ArchiveManifest,
}

#[instrument(skip_all, fields(code = %inputs.code_dir.display()))]
pub fn stage(
    sandbox: &mut dyn Sandbox,
    inputs: &StageInputs<'_>,
    vendor: &VendorConfig,
    host: Arc<dyn HostCapabilities>,
    sink: &dyn EventSink,
) -> Result<StagedWorkflow> {
    let events = StageEvents::new(sink, "stage");

    let mirrored = mirror_tree(sandbox.fs(), inputs.code_dir, APP_ROOT)
        .with_context(|| format!("mirror {} into {APP_ROOT}", inputs.code_dir.display()))?;
    events.emit(
        events
            .record(Level::Info, "code_mirrored")
            .field("files", mirrored),
    );

    let registry = load_registry(&inputs.code_dir.join(REGISTRY_FILE))?;
    let table = build_table(sandbox, &registry)?;
    events.emit(
        events
            .record(Level::Info, "agents_resolved")
            .field("agents", table.names().map(str::to_string).collect::<Vec<_>>())
            .field("root", registry.root_agent.clone()),
    );

    sandbox.inject_host(host)?;

    let package_files = inputs.deps_manifest.package_files.clone().unwrap_or_default();
    let bootstrap: BTreeSet<String> = vendor.bootstrap_set().into_iter().collect();
    for package in &bootstrap {
        let archive = package_path(inputs.deps_dir, &package_files, package, InstallPass::Bootstrap)?;
        sandbox
            .unpack_into_library(package, &archive)
            .map_err(|err| install_error(InstallPass::Bootstrap, package, &err))?;
        emit_installed(&events, InstallPass::Bootstrap, package);
    }
    if !sandbox.has_installer() {
        return Err(InstallError {
            pass: InstallPass::General,
            package: normalize_name(&vendor.installer_package),
            reason: "installer unavailable after bootstrap pass".to_string(),
        }
        .into());
    }

    let resolved = inputs.deps_manifest.resolved_packages.clone().unwrap_or_default();
    for package in resolved.iter().filter(|name| !bootstrap.contains(*name)) {
        let archive = package_path(inputs.deps_dir, &package_files, package, InstallPass::General)?;
        sandbox
            .install_package(package, &archive)
            .map_err(|err| install_error(InstallPass::General, package, &err))?;
        emit_installed(&events, InstallPass::General, package);
    }

    Ok(StagedWorkflow { registry, table })
}

/// Resolve every registry entry against the sandbox. An unknown module is
/// rejected here rather than at call time.
pub fn build_table(sandbox: &dyn Sandbox, registry: &AgentRegistry) -> Result<AgentTable> {
    let mut table = AgentTable::default();
    for agent in &registry.agents {
        let handle = sandbox
            .resolve_module(&agent.module_path)
            .with_context(|| format!("resolve agent '{}' ({})", agent.name, agent.module_path))?;
        table.insert(&agent.name, handle);
    }
    Ok(table)
}

fn package_path(
    deps_dir: &Path,
    package_files: &BTreeMap<String, String>,
    package: &str,
    pass: InstallPass,
) -> Result<PathBuf> {
    let Some(filename) = package_files.get(package) else {
        return Err(InstallError {
            pass,
            package: package.to_string(),
            reason: "not present in the dependency artifact".to_string(),
        }
        .into());
    };
    let path = deps_dir.join(PACKAGES_DIR).join(filename);
    if !path.is_file() {
        return Err(InstallError {
            pass,
            package: package.to_string(),
            reason: format!("file {} missing from unpacked dependencies", path.display()),
        }
        .into());
    }
    Ok(path)
}

fn install_error(pass: InstallPass, package: &str, err: &anyhow::Error) -> anyhow::Error {
    InstallError {
        pass,
        package: package.to_string(),
        reason: format!("{err:#}"),
    }
    .into()
}

fn emit_installed(events: &StageEvents<'_>, pass: InstallPass, package: &str) {
    events.emit(
        events
            .record(Level::Info, "package_installed")
            .field("pass", pass.to_string())
            .field("package", package.to_string()),
    );
}
