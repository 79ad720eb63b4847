//! End-to-end run: verify → unpack → check trees → stage → execute.
//!
//! Each run gets its own directory under `<dist>/runs/<run_id>/` holding the
//! unpacked artifacts, the sandbox root, `events.jsonl` and `report.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::agents::ModuleTable;
use crate::engine::{Engine, EngineContext, WorkflowRun};
use crate::io::archive::unpack_archive;
use crate::io::config::AgentpackConfig;
use crate::io::events::{EventSink, FanoutEventSink, JsonlEventSink};
use crate::io::manifest::write_json;
use crate::io::sandbox::{HostCapabilities, HostInfo, NativeSandbox, Sandbox, TracingHost};
use crate::package::ArtifactPaths;
use crate::stage::{StageInputs, stage};
use crate::verify::{verify_dist, verify_unpacked_tree};

pub const RUNS_DIR: &str = "runs";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const REPORT_FILE: &str = "report.json";

/// Initial task of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub input: Value,
    pub config: Value,
}

/// Where one run's files live.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub dir: PathBuf,
    pub code_dir: PathBuf,
    pub deps_dir: PathBuf,
    pub sandbox_dir: PathBuf,
    pub events: PathBuf,
    pub report: PathBuf,
}

impl RunPaths {
    pub fn new(dist: &Path, run_id: &str) -> Self {
        let dir = dist.join(RUNS_DIR).join(run_id);
        Self {
            run_id: run_id.to_string(),
            code_dir: dir.join("code"),
            deps_dir: dir.join("deps"),
            sandbox_dir: dir.join("sandbox"),
            events: dir.join(EVENTS_FILE),
            report: dir.join(REPORT_FILE),
            dir,
        }
    }
}

/// Run id: UTC timestamp plus a short random suffix.
pub fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Finished run with the paths it wrote.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub paths: RunPaths,
    pub run: WorkflowRun,
}

/// Run the packaged workflow of `root` in the reference sandbox.
pub fn run_workflow(
    root: &Path,
    cfg: &AgentpackConfig,
    request: RunRequest,
    modules: ModuleTable,
    sink: &dyn EventSink,
) -> Result<RunOutcome> {
    let paths = RunPaths::new(&cfg.dist_dir(root), &new_run_id());
    let mut sandbox = NativeSandbox::new(&paths.sandbox_dir, modules, &cfg.vendor.installer_package)?;
    run_workflow_in(root, cfg, request, &mut sandbox, paths, sink)
}

/// Run the packaged workflow of `root` in `sandbox`.
#[instrument(skip_all, fields(run_id = %paths.run_id))]
pub fn run_workflow_in(
    root: &Path,
    cfg: &AgentpackConfig,
    request: RunRequest,
    sandbox: &mut dyn Sandbox,
    paths: RunPaths,
    sink: &dyn EventSink,
) -> Result<RunOutcome> {
    fs::create_dir_all(&paths.dir).with_context(|| format!("create {}", paths.dir.display()))?;
    let jsonl = JsonlEventSink::create(&paths.events)?;
    let sinks: Vec<&dyn EventSink> = vec![sink, &jsonl];
    let sink = FanoutEventSink::new(sinks);

    let dist = cfg.dist_dir(root);
    let verified = verify_dist(&dist, &sink)?;
    unpack_archive(&ArtifactPaths::code(&dist).archive, &paths.code_dir)?;
    unpack_archive(&ArtifactPaths::deps(&dist).archive, &paths.deps_dir)?;
    verify_unpacked_tree(&verified.code, &paths.code_dir)?;
    verify_unpacked_tree(&verified.deps, &paths.deps_dir)?;

    let host: Arc<dyn HostCapabilities> = Arc::new(TracingHost::new(HostInfo {
        runtime: verified.code.runtime.clone(),
        runtime_version: verified.code.runtime_version.clone(),
        language: verified.code.language.clone(),
        language_version: verified.code.language_version.clone(),
        host_version: env!("CARGO_PKG_VERSION").to_string(),
    }));
    let staged = stage(
        sandbox,
        &StageInputs {
            code_dir: &paths.code_dir,
            deps_dir: &paths.deps_dir,
            deps_manifest: &verified.deps,
        },
        &cfg.vendor,
        host,
        &sink,
    )?;

    let mut engine = Engine::new(
        EngineContext {
            table: &staged.table,
            limits: cfg.engine.limits(),
            step_timeout: cfg.engine.step_timeout(),
            sink: &sink,
        },
        sandbox,
    );
    let run = engine.run(&staged.registry.root_agent, request.input, request.config)?;
    write_json(&paths.report, &run.report(&paths.run_id))?;
    info!(report = %paths.report.display(), "run report written");
    Ok(RunOutcome { paths, run })
}
