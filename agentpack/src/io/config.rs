//! Workspace configuration stored in `agentpack.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::requirements::normalize_name;
use crate::core::workflow::{DEFAULT_MAX_STEPS, DEFAULT_STAGNATION_THRESHOLD, Limits};
use crate::io::fetch::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "agentpack.toml";

/// Workspace configuration (TOML).
///
/// Missing fields default to values that work against the public package CDN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AgentpackConfig {
    pub runtime: RuntimeConfig,
    pub layout: LayoutConfig,
    pub vendor: VendorConfig,
    pub engine: EngineConfig,
}

/// Identity of the sandbox runtime the artifacts target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub name: String,
    pub version: String,
    pub language: String,
    pub language_version: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "pyodide".to_string(),
            version: "0.26.1".to_string(),
            language: "python".to_string(),
            language_version: "3.12.1".to_string(),
        }
    }
}

/// Workspace-relative directories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LayoutConfig {
    pub dist_dir: PathBuf,
    pub vendor_dir: PathBuf,
    /// Host runtime files shipped under `runtime/` in the code artifact.
    pub runtime_dir: PathBuf,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            dist_dir: PathBuf::from("dist"),
            vendor_dir: PathBuf::from("vendor"),
            runtime_dir: PathBuf::from("runtime"),
        }
    }
}

/// Dependency vendoring settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VendorConfig {
    /// Packages the installer needs before it can install anything else.
    pub bootstrap_packages: Vec<String>,
    /// The package that provides the general installer.
    pub installer_package: String,
    /// Download location template; `{version}` is replaced by the catalog version.
    pub download_base: String,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            bootstrap_packages: vec!["micropip".to_string(), "packaging".to_string()],
            installer_package: "micropip".to_string(),
            download_base: "https://cdn.jsdelivr.net/pyodide/v{version}/full/".to_string(),
            max_attempts: 3,
            backoff_ms: 500,
            timeout_secs: 60,
        }
    }
}

impl VendorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }

    /// Bootstrap package names, normalised.
    pub fn bootstrap_set(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .bootstrap_packages
            .iter()
            .map(|name| normalize_name(name))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Orchestration bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_steps: u32,
    pub stagnation_threshold: u32,
    /// Per-invocation wall-clock bound. Unset means unbounded.
    pub step_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            stagnation_threshold: DEFAULT_STAGNATION_THRESHOLD,
            step_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            max_steps: self.max_steps,
            stagnation_threshold: self.stagnation_threshold,
        }
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

impl AgentpackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runtime.name.trim().is_empty() || self.runtime.language.trim().is_empty() {
            return Err(anyhow!("runtime.name and runtime.language must be non-empty"));
        }
        if self.vendor.max_attempts == 0 {
            return Err(anyhow!("vendor.max_attempts must be > 0"));
        }
        if self.vendor.timeout_secs == 0 {
            return Err(anyhow!("vendor.timeout_secs must be > 0"));
        }
        let installer = normalize_name(&self.vendor.installer_package);
        if !self.vendor.bootstrap_set().contains(&installer) {
            return Err(anyhow!(
                "vendor.installer_package '{}' must be listed in vendor.bootstrap_packages",
                self.vendor.installer_package
            ));
        }
        if self.engine.max_steps == 0 {
            return Err(anyhow!("engine.max_steps must be > 0"));
        }
        if self.engine.stagnation_threshold == 0 {
            return Err(anyhow!("engine.stagnation_threshold must be > 0"));
        }
        if self.engine.step_timeout_secs == Some(0) {
            return Err(anyhow!("engine.step_timeout_secs must be > 0 when set"));
        }
        Ok(())
    }

    /// Resolve a layout directory against the workspace root.
    pub fn dist_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.layout.dist_dir)
    }

    pub fn vendor_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.layout.vendor_dir)
    }

    pub fn runtime_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.layout.runtime_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentpackConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentpackConfig> {
    if !path.exists() {
        let cfg = AgentpackConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentpackConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load `agentpack.toml` from a workspace root.
pub fn load_workspace_config(root: &Path) -> Result<AgentpackConfig> {
    load_config(&root.join(CONFIG_FILE_NAME))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentpackConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentpackConfig::default());
        assert_eq!(cfg.engine.limits(), Limits::default());
        assert_eq!(cfg.engine.step_timeout(), None);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        let mut cfg = AgentpackConfig::default();
        cfg.engine.step_timeout_secs = Some(30);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[engine]\nmax_steps = 7\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.engine.max_steps, 7);
        assert_eq!(cfg.engine.stagnation_threshold, DEFAULT_STAGNATION_THRESHOLD);
        assert_eq!(cfg.vendor, VendorConfig::default());
    }

    #[test]
    fn installer_must_be_bootstrapped() {
        let mut cfg = AgentpackConfig::default();
        cfg.vendor.installer_package = "pip".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("installer_package"));
    }

    #[test]
    fn zero_step_timeout_is_rejected() {
        let mut cfg = AgentpackConfig::default();
        cfg.engine.step_timeout_secs = Some(0);
        assert!(cfg.validate().is_err());
    }
}
