//! Test-only fakes and workspace fixtures.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};

use crate::core::protocol::InputTape;
use crate::io::config::{AgentpackConfig, CONFIG_FILE_NAME, write_config};
use crate::io::events::{EventRecord, EventSink};
use crate::io::fetch::Fetcher;
use crate::io::sandbox::{
    HostCapabilities, Invocation, InvokeOutcome, ModuleHandle, Sandbox, VirtualFs,
};

/// Collects events in memory.
#[derive(Default)]
pub struct MemoryEventSink {
    events: RefCell<Vec<EventRecord>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.borrow().clone()
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<String> {
        self.events.borrow().iter().map(|e| e.event.clone()).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, record: EventRecord) {
        self.events.borrow_mut().push(record);
    }
}

/// Serves canned bodies keyed by the last URL segment. Unknown files fail.
#[derive(Default)]
pub struct StubFetcher {
    bodies: BTreeMap<String, Vec<u8>>,
    calls: RefCell<Vec<String>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, file_name: &str, body: Vec<u8>) -> Self {
        self.bodies.insert(file_name.to_string(), body);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Fetcher for StubFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.borrow_mut().push(url.to_string());
        let file_name = url.rsplit('/').next().unwrap_or(url);
        self.bodies
            .get(file_name)
            .cloned()
            .ok_or_else(|| anyhow!("404 Not Found: {url}"))
    }
}

/// In-memory sandbox filesystem.
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl MemoryFs {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

impl VirtualFs for MemoryFs {
    fn create_dir_all(&mut self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
        Ok(())
    }

    fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.create_dir_all(parent)?;
        }
        self.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(path).cloned())
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        self.files.remove(path);
        Ok(())
    }

    fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path.trim_end_matches('/'))
    }
}

/// One scripted answer of [`ScriptedSandbox::invoke`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Write this document with the received trace id filled in.
    Echo(Value),
    /// Write this document verbatim.
    Raw(Value),
    /// Write these bytes verbatim.
    Bytes(Vec<u8>),
    /// Write nothing.
    NoTape,
    Failed(String),
    TimedOut,
}

impl ScriptedReply {
    pub fn complete(result: Value) -> Self {
        ScriptedReply::Echo(json!({"status": "complete", "result": result}))
    }

    pub fn pending(progress: f64, agent: &str, input: Value) -> Self {
        ScriptedReply::Echo(json!({
            "status": "pending",
            "progress": progress,
            "action": {
                "type": "run_agent",
                "payload": {"agent_name": agent, "input_data": input}
            }
        }))
    }
}

/// A call observed by [`ScriptedSandbox`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedCall {
    pub module_path: String,
    pub tape: InputTape,
    pub config: Value,
}

/// Sandbox that answers invocations from a queue of scripted replies.
///
/// Once the queue is empty, the last reply repeats.
pub struct ScriptedSandbox {
    fs: MemoryFs,
    modules: BTreeSet<String>,
    replies: VecDeque<ScriptedReply>,
    last: Option<ScriptedReply>,
    installer: String,
    installed: Vec<String>,
    calls: Vec<ObservedCall>,
    host_injected: bool,
    reject_install: BTreeSet<String>,
}

impl ScriptedSandbox {
    pub fn new(modules: &[&str], replies: Vec<ScriptedReply>) -> Self {
        Self {
            fs: MemoryFs::default(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
            replies: replies.into(),
            last: None,
            installer: "micropip".to_string(),
            installed: Vec::new(),
            calls: Vec::new(),
            host_injected: false,
            reject_install: BTreeSet::new(),
        }
    }

    /// Make `install_package` fail for `package`.
    pub fn reject_install(mut self, package: &str) -> Self {
        self.reject_install.insert(package.to_string());
        self
    }

    pub fn calls(&self) -> &[ObservedCall] {
        &self.calls
    }

    /// Packages in installation order.
    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    pub fn host_injected(&self) -> bool {
        self.host_injected
    }

    pub fn memory_fs(&self) -> &MemoryFs {
        &self.fs
    }

    fn next_reply(&mut self) -> Option<ScriptedReply> {
        if let Some(reply) = self.replies.pop_front() {
            self.last = Some(reply.clone());
            return Some(reply);
        }
        self.last.clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn fs(&mut self) -> &mut dyn VirtualFs {
        &mut self.fs
    }

    fn inject_host(&mut self, _host: Arc<dyn HostCapabilities>) -> Result<()> {
        self.host_injected = true;
        Ok(())
    }

    fn unpack_into_library(&mut self, package: &str, archive: &Path) -> Result<()> {
        if !archive.is_file() {
            return Err(anyhow!("missing archive {}", archive.display()));
        }
        self.installed.push(package.to_string());
        Ok(())
    }

    fn has_installer(&self) -> bool {
        self.installed.contains(&self.installer)
    }

    fn install_package(&mut self, package: &str, archive: &Path) -> Result<()> {
        if !self.has_installer() {
            return Err(anyhow!("installer not available"));
        }
        if self.reject_install.contains(package) {
            return Err(anyhow!("wheel for {package} is not compatible"));
        }
        self.unpack_into_library(package, archive)
    }

    fn resolve_module(&self, module_path: &str) -> Result<ModuleHandle> {
        if !self.modules.contains(module_path) {
            return Err(anyhow!("no module '{module_path}'"));
        }
        Ok(ModuleHandle {
            module_path: module_path.to_string(),
        })
    }

    fn invoke(&mut self, invocation: &Invocation<'_>) -> Result<InvokeOutcome> {
        let raw = self
            .fs
            .read_file(invocation.input_tape)?
            .context("input tape missing")?;
        let tape: InputTape = serde_json::from_slice(&raw).context("parse input tape")?;
        self.calls.push(ObservedCall {
            module_path: invocation.module.module_path.clone(),
            tape: tape.clone(),
            config: invocation.config.clone(),
        });

        let reply = self.next_reply().context("no scripted reply")?;
        let bytes = match reply {
            ScriptedReply::Echo(mut doc) => {
                doc["trace_id"] = Value::String(tape.trace_id);
                serde_json::to_vec(&doc)?
            }
            ScriptedReply::Raw(doc) => serde_json::to_vec(&doc)?,
            ScriptedReply::Bytes(bytes) => bytes,
            ScriptedReply::NoTape => return Ok(InvokeOutcome::Finished),
            ScriptedReply::Failed(reason) => return Ok(InvokeOutcome::Failed { reason }),
            ScriptedReply::TimedOut => {
                return Ok(InvokeOutcome::TimedOut {
                    elapsed: invocation.timeout.unwrap_or_default(),
                });
            }
        };
        self.fs.write_file(invocation.output_tape, &bytes)?;
        Ok(InvokeOutcome::Finished)
    }
}

/// Wheel (zip) bytes holding `<module>/__init__.py` and a dist-info
/// `METADATA` record.
pub fn wheel_bytes(name: &str) -> Result<Vec<u8>> {
    use std::io::Write;

    let module = name.replace('-', "_");
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    writer
        .start_file(format!("{module}/__init__.py"), options)
        .context("start module entry")?;
    writer
        .write_all(format!("__version__ = \"1.0\"  # {name}\n").as_bytes())
        .context("write module entry")?;
    writer
        .start_file(format!("{module}-1.0.dist-info/METADATA"), options)
        .context("start metadata entry")?;
    writer
        .write_all(format!("Metadata-Version: 2.1\nName: {name}\nVersion: 1.0\n").as_bytes())
        .context("write metadata entry")?;
    Ok(writer.finish().context("finish wheel")?.into_inner())
}

/// A temporary agent workspace with a root and a multiplier agent.
pub struct TestWorkspace {
    temp: tempfile::TempDir,
}

impl TestWorkspace {
    /// Root agent requires `numpy`; multiplier declares nothing.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let workspace = Self { temp };
        workspace.write("agent/main.py", "def main(config):\n    ...\n")?;
        workspace.write("agent/requirements.txt", "numpy>=1.26  # vectors\n")?;
        workspace.write("agent-multiplier/main.py", "def main(config):\n    ...\n")?;
        workspace.write("runtime/bootstrap.py", "# sandbox entry shim\n")?;
        let mut cfg = AgentpackConfig::default();
        cfg.vendor.backoff_ms = 0;
        cfg.vendor.max_attempts = 2;
        cfg.vendor.download_base = "https://packages.test/v{version}/".to_string();
        write_config(&workspace.path().join(CONFIG_FILE_NAME), &cfg)?;
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Catalog covering the bootstrap set, `numpy` and `six`, written to
    /// `catalog.json`.
    pub fn write_catalog(&self) -> Result<PathBuf> {
        let catalog = json!({
            "info": {"version": "0.26.1", "python": "3.12.1"},
            "packages": {
                "micropip": {"name": "micropip", "file_name": "micropip-0.6.0-py3-none-any.whl", "depends": ["packaging"]},
                "packaging": {"name": "packaging", "file_name": "packaging-23.2-py3-none-any.whl", "depends": []},
                "numpy": {"name": "numpy", "file_name": "numpy-1.26.4-cp312-cp312-wasm32.whl", "depends": []},
                "six": {"name": "six", "file_name": "six-1.16.0-py2.py3-none-any.whl", "depends": []}
            }
        });
        self.write("catalog.json", &serde_json::to_string_pretty(&catalog)?)
    }

    /// Fetcher serving a package archive for every catalog entry.
    pub fn fetcher(&self) -> Result<StubFetcher> {
        Ok(StubFetcher::new()
            .with("micropip-0.6.0-py3-none-any.whl", wheel_bytes("micropip")?)
            .with("packaging-23.2-py3-none-any.whl", wheel_bytes("packaging")?)
            .with("numpy-1.26.4-cp312-cp312-wasm32.whl", wheel_bytes("numpy")?)
            .with("six-1.16.0-py2.py3-none-any.whl", wheel_bytes("six")?))
    }
}
