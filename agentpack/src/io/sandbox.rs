//! Capability interface of the isolated execution environment.
//!
//! The engine and stager only talk to a [`Sandbox`]: a virtual filesystem,
//! host capability injection, the two dependency installation passes, module
//! resolution and invocation. [`NativeSandbox`] is the local reference
//! implementation: a directory-backed filesystem plus a table of native
//! agents.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agents::ModuleTable;
use crate::core::protocol::InputTape;
use crate::core::requirements::normalize_name;
use crate::io::archive::{collect_files, unpack_package_file};

/// Where the code tree is mirrored inside the sandbox.
pub const APP_ROOT: &str = "/app";
/// Where installed packages live inside the sandbox.
pub const LIBRARY_ROOT: &str = "/lib/site-packages";
pub const INPUT_TAPE_PATH: &str = "/tmp/input_tape.json";
pub const OUTPUT_TAPE_PATH: &str = "/tmp/output_tape.json";

/// Filesystem visible to code running in the sandbox. Paths are absolute and
/// `/`-separated.
pub trait VirtualFs {
    fn create_dir_all(&mut self, path: &str) -> Result<()>;
    fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<()>;
    /// `Ok(None)` when the file does not exist.
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;
    /// Removing a missing file is not an error.
    fn remove_file(&mut self, path: &str) -> Result<()>;
    fn is_dir(&self, path: &str) -> bool;
}

/// Identity the host reports to agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub runtime: String,
    pub runtime_version: String,
    pub language: String,
    pub language_version: String,
    pub host_version: String,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            runtime: "native".to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            language: "rust".to_string(),
            language_version: String::new(),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Services the host lends to agents: logging and sleeping.
pub trait HostCapabilities: Send + Sync {
    fn info(&self) -> &HostInfo;
    fn log(&self, agent: &str, message: &str);
    fn sleep(&self, duration: Duration);
}

/// Host capabilities backed by `tracing` and the current thread.
#[derive(Debug, Clone)]
pub struct TracingHost {
    info: HostInfo,
}

impl TracingHost {
    pub fn new(info: HostInfo) -> Self {
        Self { info }
    }
}

impl HostCapabilities for TracingHost {
    fn info(&self) -> &HostInfo {
        &self.info
    }

    fn log(&self, agent: &str, message: &str) {
        info!(agent, "{message}");
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A module resolved inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    pub module_path: String,
}

/// One agent call.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub module: &'a ModuleHandle,
    pub config: &'a Value,
    pub input_tape: &'a str,
    pub output_tape: &'a str,
    pub timeout: Option<Duration>,
}

/// How an invocation ended. The engine reads the output tape on `Finished`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    Finished,
    /// The agent raised; no output tape was written.
    Failed { reason: String },
    TimedOut { elapsed: Duration },
}

/// Capability interface of the execution environment.
pub trait Sandbox {
    fn fs(&mut self) -> &mut dyn VirtualFs;
    fn inject_host(&mut self, host: Arc<dyn HostCapabilities>) -> Result<()>;
    /// Place a package straight into the library path, without an installer.
    fn unpack_into_library(&mut self, package: &str, archive: &Path) -> Result<()>;
    /// Whether the general installer is usable.
    fn has_installer(&self) -> bool;
    /// Install a package from a local archive through the installer.
    fn install_package(&mut self, package: &str, archive: &Path) -> Result<()>;
    fn resolve_module(&self, module_path: &str) -> Result<ModuleHandle>;
    fn invoke(&mut self, invocation: &Invocation<'_>) -> Result<InvokeOutcome>;
}

/// Copy every regular file under `src` into the sandbox below `dest`.
/// Returns the number of files written.
pub fn mirror_tree(fs: &mut dyn VirtualFs, src: &Path, dest: &str) -> Result<usize> {
    let files = collect_files(src)?;
    fs.create_dir_all(dest)?;
    for (rel, path) in &files {
        let contents = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let target = format!("{}/{rel}", dest.trim_end_matches('/'));
        if let Some((parent, _)) = target.rsplit_once('/')
            && !parent.is_empty()
        {
            fs.create_dir_all(parent)?;
        }
        fs.write_file(&target, &contents)?;
    }
    Ok(files.len())
}

/// Sandbox paths mapped onto a host directory.
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Host path for a sandbox path. Relative paths and `..` are rejected.
    pub fn host_path(&self, path: &str) -> Result<PathBuf> {
        if !path.starts_with('/') {
            return Err(anyhow!("sandbox path must be absolute: {path}"));
        }
        let mut host = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => host.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(anyhow!("sandbox path escapes its root: {path}"));
                }
            }
        }
        Ok(host)
    }
}

impl VirtualFs for DirFs {
    fn create_dir_all(&mut self, path: &str) -> Result<()> {
        let host = self.host_path(path)?;
        fs::create_dir_all(&host).with_context(|| format!("create {}", host.display()))
    }

    fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&host, contents).with_context(|| format!("write {}", host.display()))
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let host = self.host_path(path)?;
        if !host.is_file() {
            return Ok(None);
        }
        fs::read(&host)
            .map(Some)
            .with_context(|| format!("read {}", host.display()))
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        let host = self.host_path(path)?;
        match fs::remove_file(&host) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", host.display())),
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        self.host_path(path).is_ok_and(|host| host.is_dir())
    }
}

/// Reference sandbox running native agents over a directory-backed VFS.
///
/// Package files (wheels or `.tar.gz`) are unpacked into [`LIBRARY_ROOT`]. The
/// configured installer package must be unpacked by the bootstrap pass before
/// [`Sandbox::install_package`] accepts anything. Timeouts are measured after
/// the agent returns; a native agent cannot be preempted.
pub struct NativeSandbox {
    fs: DirFs,
    modules: ModuleTable,
    installer_package: String,
    installed: BTreeSet<String>,
    host: Option<Arc<dyn HostCapabilities>>,
}

impl NativeSandbox {
    pub fn new(root: &Path, modules: ModuleTable, installer_package: &str) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create sandbox {}", root.display()))?;
        Ok(Self {
            fs: DirFs::new(root),
            modules,
            installer_package: normalize_name(installer_package),
            installed: BTreeSet::new(),
            host: None,
        })
    }

    /// Normalised names of installed packages.
    pub fn installed(&self) -> &BTreeSet<String> {
        &self.installed
    }

    fn unpack_package(&mut self, package: &str, archive: &Path) -> Result<()> {
        let library = self.fs.host_path(LIBRARY_ROOT)?;
        unpack_package_file(archive, &library)
            .with_context(|| format!("unpack {package} from {}", archive.display()))?;
        self.installed.insert(normalize_name(package));
        Ok(())
    }
}

impl Sandbox for NativeSandbox {
    fn fs(&mut self) -> &mut dyn VirtualFs {
        &mut self.fs
    }

    fn inject_host(&mut self, host: Arc<dyn HostCapabilities>) -> Result<()> {
        let info = serde_json::to_vec_pretty(host.info()).context("serialize host info")?;
        self.fs.write_file(&format!("{APP_ROOT}/host.json"), &info)?;
        self.host = Some(host);
        Ok(())
    }

    #[instrument(skip(self, archive))]
    fn unpack_into_library(&mut self, package: &str, archive: &Path) -> Result<()> {
        self.unpack_package(package, archive)
    }

    fn has_installer(&self) -> bool {
        self.installed.contains(&self.installer_package)
    }

    #[instrument(skip(self, archive))]
    fn install_package(&mut self, package: &str, archive: &Path) -> Result<()> {
        if !self.has_installer() {
            return Err(anyhow!(
                "installer '{}' is not available in the sandbox",
                self.installer_package
            ));
        }
        self.unpack_package(package, archive)
    }

    fn resolve_module(&self, module_path: &str) -> Result<ModuleHandle> {
        if self.modules.get(module_path).is_none() {
            return Err(anyhow!("no module '{module_path}' in sandbox"));
        }
        let package = match module_path.rsplit_once('.') {
            Some((package, _)) => package,
            None => module_path,
        };
        let dir = format!("{APP_ROOT}/{}", package.replace('.', "/"));
        if !self.fs.is_dir(&dir) {
            return Err(anyhow!("module '{module_path}' has no sources at {dir}"));
        }
        Ok(ModuleHandle {
            module_path: module_path.to_string(),
        })
    }

    fn invoke(&mut self, invocation: &Invocation<'_>) -> Result<InvokeOutcome> {
        let module_path = &invocation.module.module_path;
        let agent = self
            .modules
            .get(module_path)
            .ok_or_else(|| anyhow!("no module '{module_path}' in sandbox"))?;
        let host = self
            .host
            .clone()
            .ok_or_else(|| anyhow!("host capabilities were not injected"))?;
        let raw = self
            .fs
            .read_file(invocation.input_tape)?
            .ok_or_else(|| anyhow!("input tape {} is missing", invocation.input_tape))?;
        let tape: InputTape = serde_json::from_slice(&raw).context("parse input tape")?;

        let started = Instant::now();
        let outcome = agent.run(&tape.payload, invocation.config, host.as_ref());
        let elapsed = started.elapsed();
        if let Some(timeout) = invocation.timeout
            && elapsed > timeout
        {
            warn!(module = %module_path, ?elapsed, ?timeout, "agent exceeded step timeout");
            return Ok(InvokeOutcome::TimedOut { elapsed });
        }

        match outcome {
            Ok(output) => {
                let document = output.to_tape(&tape.trace_id);
                let bytes = serde_json::to_vec(&document).context("serialize output tape")?;
                self.fs.write_file(invocation.output_tape, &bytes)?;
                debug!(module = %module_path, ?elapsed, "agent finished");
                Ok(InvokeOutcome::Finished)
            }
            Err(err) => {
                warn!(module = %module_path, err = %err, "agent failed");
                Ok(InvokeOutcome::Failed {
                    reason: format!("{err:#}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::archive::write_archive;
    use crate::test_support::wheel_bytes;
    use serde_json::json;

    fn package_archive(dir: &Path, name: &str) -> PathBuf {
        let tree = dir.join(format!("{name}-tree"));
        fs::create_dir_all(tree.join(name)).expect("mkdir");
        fs::write(tree.join(name).join("__init__.py"), "").expect("write");
        write_archive(&tree, &dir.join(format!("{name}.tar.gz")))
            .expect("archive")
            .path
    }

    #[test]
    fn dir_fs_rejects_escaping_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let fs = DirFs::new(temp.path());
        assert!(fs.host_path("/app/../../etc/passwd").is_err());
        assert!(fs.host_path("relative").is_err());
        assert_eq!(
            fs.host_path("/app/./agents").expect("path"),
            temp.path().join("app/agents")
        );
    }

    #[test]
    fn install_requires_bootstrapped_installer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let micropip = temp.path().join("micropip-0.6.0-py3-none-any.whl");
        fs::write(&micropip, wheel_bytes("micropip").expect("wheel")).expect("write wheel");
        let six = package_archive(temp.path(), "six");
        let mut sandbox =
            NativeSandbox::new(&temp.path().join("sandbox"), ModuleTable::new(), "micropip")
                .expect("sandbox");

        assert!(!sandbox.has_installer());
        assert!(sandbox.install_package("six", &six).is_err());

        sandbox
            .unpack_into_library("micropip", &micropip)
            .expect("bootstrap");
        assert!(sandbox.has_installer());
        sandbox.install_package("six", &six).expect("install");
        assert!(sandbox.installed().contains("six"));
        let library = temp.path().join("sandbox/lib/site-packages");
        assert!(library.join("micropip/__init__.py").is_file());
        assert!(library.join("micropip-1.0.dist-info/METADATA").is_file());
        assert!(library.join("six/__init__.py").is_file());
    }

    #[test]
    fn invoke_writes_output_tape_with_echoed_trace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut sandbox =
            NativeSandbox::new(temp.path(), ModuleTable::builtin(), "micropip").expect("sandbox");
        sandbox
            .fs()
            .create_dir_all("/app/agents/multiplier")
            .expect("mkdir");
        sandbox
            .inject_host(Arc::new(TracingHost::new(HostInfo::default())))
            .expect("host");
        let module = sandbox
            .resolve_module("agents.multiplier.main")
            .expect("resolve");
        let input = json!({"trace_id": "t-1", "payload": {"number": 3}});
        sandbox
            .fs()
            .write_file(INPUT_TAPE_PATH, input.to_string().as_bytes())
            .expect("input");

        let config = json!({});
        let outcome = sandbox
            .invoke(&Invocation {
                module: &module,
                config: &config,
                input_tape: INPUT_TAPE_PATH,
                output_tape: OUTPUT_TAPE_PATH,
                timeout: None,
            })
            .expect("invoke");
        assert_eq!(outcome, InvokeOutcome::Finished);
        let raw = sandbox
            .fs()
            .read_file(OUTPUT_TAPE_PATH)
            .expect("read")
            .expect("tape");
        let output: Value = serde_json::from_slice(&raw).expect("json");
        assert_eq!(output["trace_id"], "t-1");
        assert_eq!(output["result"], 6.0);
    }

    #[test]
    fn resolve_requires_mirrored_sources() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox =
            NativeSandbox::new(temp.path(), ModuleTable::builtin(), "micropip").expect("sandbox");
        let err = sandbox.resolve_module("agents.root.main").unwrap_err();
        assert!(err.to_string().contains("no sources"));
        assert!(sandbox.resolve_module("agents.ghost.main").is_err());
    }

    /// Verifies an agent that sleeps through the host past the step timeout is
    /// reported as timed out and leaves no output tape.
    #[test]
    fn agent_sleeping_past_the_timeout_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut sandbox =
            NativeSandbox::new(temp.path(), ModuleTable::builtin(), "micropip").expect("sandbox");
        sandbox
            .fs()
            .create_dir_all("/app/agents/multiplier")
            .expect("mkdir");
        sandbox
            .inject_host(Arc::new(TracingHost::new(HostInfo::default())))
            .expect("host");
        let module = sandbox
            .resolve_module("agents.multiplier.main")
            .expect("resolve");
        let input = json!({"trace_id": "t-2", "payload": {"number": 3}});
        sandbox
            .fs()
            .write_file(INPUT_TAPE_PATH, input.to_string().as_bytes())
            .expect("input");

        let config = json!({"delay_ms": 60});
        let outcome = sandbox
            .invoke(&Invocation {
                module: &module,
                config: &config,
                input_tape: INPUT_TAPE_PATH,
                output_tape: OUTPUT_TAPE_PATH,
                timeout: Some(Duration::from_millis(10)),
            })
            .expect("invoke");
        let InvokeOutcome::TimedOut { elapsed } = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert!(elapsed >= Duration::from_millis(60));
        assert!(sandbox.fs().read_file(OUTPUT_TAPE_PATH).expect("read").is_none());
    }
}
