//! Package agents into verifiable artifacts and run them as a chain.
//!
//! Build side: `discover`, `vendor`, `package` (or `build` for both), then
//! `verify`. Run side: `run` verifies, stages and executes the workflow.

use std::path::{Path, PathBuf};

use agentpack::agents::ModuleTable;
use agentpack::exit_codes;
use agentpack::io::catalog::load_catalog;
use agentpack::io::config::{AgentpackConfig, load_workspace_config};
use agentpack::io::discover::discover;
use agentpack::io::events::{EventSink, FanoutEventSink, JsonlEventSink, TracingEventSink};
use agentpack::io::fetch::HttpFetcher;
use agentpack::logging;
use agentpack::package::package;
use agentpack::run::{RunRequest, run_workflow};
use agentpack::vendor::vendor;
use agentpack::verify::verify_dist;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

const BUILD_EVENTS_FILE: &str = "events.jsonl";

#[derive(Parser)]
#[command(
    name = "agentpack",
    version,
    about = "Package agent chains into verifiable artifacts and run them"
)]
struct Cli {
    /// Workspace root holding `agent/`, `agent-<name>/` and `agentpack.toml`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List agents and the requested package set.
    Discover,
    /// Resolve and download the dependency closure into the vendor dir.
    Vendor {
        /// Package catalog (lock file) JSON.
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Build code and dependency artifacts from vendored packages.
    Package,
    /// `vendor` followed by `package`.
    Build {
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Check artifacts against their manifests.
    Verify,
    /// Verify, stage and execute the workflow.
    Run {
        /// Initial payload for the root agent (JSON).
        #[arg(long, default_value = "{}")]
        input: String,
        /// Config for the root agent (JSON).
        #[arg(long, default_value = "{}")]
        config: String,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load_workspace_config(&cli.root)?;
    match cli.command {
        Command::Discover => cmd_discover(&cli.root, &cfg),
        Command::Vendor { catalog } => {
            with_build_sink(&cli.root, &cfg, |sink| cmd_vendor(&cli.root, &cfg, &catalog, sink))
        }
        Command::Package => with_build_sink(&cli.root, &cfg, |sink| cmd_package(&cli.root, &cfg, sink)),
        Command::Build { catalog } => with_build_sink(&cli.root, &cfg, |sink| {
            cmd_vendor(&cli.root, &cfg, &catalog, sink)?;
            cmd_package(&cli.root, &cfg, sink)
        }),
        Command::Verify => cmd_verify(&cli.root, &cfg),
        Command::Run { input, config } => cmd_run(&cli.root, &cfg, &input, &config),
    }
}

/// Build stages log to stderr via tracing and to `<dist>/events.jsonl`.
fn with_build_sink<F>(root: &Path, cfg: &AgentpackConfig, f: F) -> Result<i32>
where
    F: FnOnce(&dyn EventSink) -> Result<i32>,
{
    let jsonl = JsonlEventSink::create(&cfg.dist_dir(root).join(BUILD_EVENTS_FILE))?;
    let sinks: Vec<&dyn EventSink> = vec![&TracingEventSink, &jsonl];
    let sink = FanoutEventSink::new(sinks);
    f(&sink)
}

fn cmd_discover(root: &Path, cfg: &AgentpackConfig) -> Result<i32> {
    let found = discover(root, &cfg.vendor.bootstrap_set(), &TracingEventSink)?;
    let agents: Vec<Value> = found
        .agents
        .iter()
        .map(|agent| json!({"name": agent.name, "modulePath": agent.module_path}))
        .collect();
    let report = json!({
        "rootAgent": found.root_agent,
        "agents": agents,
        "requested": found.requested,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_codes::OK)
}

fn cmd_vendor(root: &Path, cfg: &AgentpackConfig, catalog: &Path, sink: &dyn EventSink) -> Result<i32> {
    let catalog = load_catalog(catalog)?;
    let fetcher = HttpFetcher::new(std::time::Duration::from_secs(cfg.vendor.timeout_secs))?;
    let outcome = vendor(root, cfg, &catalog, &fetcher, sink)?;
    println!(
        "vendored {} of {} package(s) into {}",
        outcome.manifest.package_files.len(),
        outcome.manifest.resolved_packages.len(),
        cfg.vendor_dir(root).display()
    );
    for package in &outcome.manifest.missing_packages {
        eprintln!("warning: {package} is not in the catalog");
    }
    for (package, reason) in &outcome.manifest.failed_packages {
        eprintln!("warning: {package} was not vendored: {reason}");
    }
    Ok(exit_codes::OK)
}

fn cmd_package(root: &Path, cfg: &AgentpackConfig, sink: &dyn EventSink) -> Result<i32> {
    let outcome = package(root, cfg, sink)?;
    for (paths, manifest) in [
        (&outcome.code, &outcome.code_manifest),
        (&outcome.deps, &outcome.deps_manifest),
    ] {
        println!("{}  {}", manifest.archive_sha256, paths.archive.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_verify(root: &Path, cfg: &AgentpackConfig) -> Result<i32> {
    let verified = verify_dist(&cfg.dist_dir(root), &TracingEventSink)?;
    for manifest in [&verified.code, &verified.deps] {
        println!("ok  {}  {}", manifest.archive_sha256, manifest.archive);
    }
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, cfg: &AgentpackConfig, input: &str, config: &str) -> Result<i32> {
    let request = RunRequest {
        input: serde_json::from_str(input).context("parse --input as JSON")?,
        config: serde_json::from_str(config).context("parse --config as JSON")?,
    };
    let outcome = run_workflow(root, cfg, request, ModuleTable::builtin(), &TracingEventSink)?;
    if outcome.run.abort_reason().is_some() {
        let report = outcome.run.report(&outcome.paths.run_id);
        eprintln!("{}", serde_json::to_string_pretty(&report)?);
        eprintln!("run report: {}", outcome.paths.report.display());
    }
    // Aborts come back as typed errors; `main` maps them to the exit code.
    let result = outcome.run.into_result()?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(exit_codes::OK)
}
