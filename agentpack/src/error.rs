//! Typed failures for build and run stages.
//!
//! Stages return `anyhow::Result`; these values ride inside the `anyhow::Error`
//! and are recovered with `downcast_ref` where a caller needs to branch on the
//! failure class (exit codes, abort reasons).

use std::path::PathBuf;

use thiserror::Error;

use crate::core::workflow::StepRecord;

/// The workspace has no usable entry point.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no agent directories found under {}", root.display())]
    NoAgents { root: PathBuf },
    #[error("no root agent directory `agent/` under {} (found: {})", root.display(), found.join(", "))]
    MissingRoot { root: PathBuf, found: Vec<String> },
    #[error("agent directory '{dir}' uses the reserved name '{name}'")]
    ReservedName { dir: String, name: String },
}

/// A package download exhausted its retry policy.
#[derive(Debug, Error)]
#[error("download of {package} failed after {} attempt(s): {}", attempts.len(), attempts.join("; "))]
pub struct DownloadError {
    pub package: String,
    pub url: String,
    /// One entry per failed attempt, in order.
    pub attempts: Vec<String>,
}

/// A bootstrap package could not be vendored, so the sandbox installer would
/// be unusable.
#[derive(Debug, Error)]
#[error(
    "vendoring failed for bootstrap package(s) {}{}{}",
    bootstrap.join(", "),
    if uncatalogued.is_empty() { String::new() } else { format!("; not in catalog: {}", uncatalogued.join(", ")) },
    failures.iter().map(|f| format!("; {f}")).collect::<String>()
)]
pub struct VendorError {
    /// Every unavailable bootstrap package, sorted.
    pub bootstrap: Vec<String>,
    /// Bootstrap packages the catalog does not list.
    pub uncatalogued: Vec<String>,
    pub failures: Vec<DownloadError>,
}

/// An artifact could not be produced or came out malformed.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("archive {} contains no entries", path.display())]
    EmptyArchive { path: PathBuf },
    #[error("vendored file {filename} for package {package} is missing from {}", dir.display())]
    MissingPackageFile {
        package: String,
        filename: String,
        dir: PathBuf,
    },
    #[error("agent source {} is not a directory", path.display())]
    MissingSource { path: PathBuf },
}

/// An artifact does not match its manifest. Always fatal.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("missing {kind} {}", path.display())]
    Missing { kind: &'static str, path: PathBuf },
    #[error("manifest {} is unreadable: {reason}", path.display())]
    InvalidManifest { path: PathBuf, reason: String },
    #[error("{} could not be read: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },
    #[error("manifest {} has no archive_sha256", path.display())]
    NoExpectedHash { path: PathBuf },
    #[error("archive {} hash mismatch: expected {expected}, actual {actual}", path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("archive {} size mismatch: expected {expected}, actual {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("unpacked file {filename} does not match manifest: {detail}")]
    FileMismatch { filename: String, detail: String },
    #[error("unpacked tree has file {filename} not listed in manifest")]
    UnexpectedFile { filename: String },
}

/// A resolved package could not be installed into the sandbox.
#[derive(Debug, Error)]
#[error("{pass} install of {package} failed: {reason}")]
pub struct InstallError {
    pub pass: InstallPass,
    pub package: String,
    pub reason: String,
}

/// Which dependency installation pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPass {
    Bootstrap,
    General,
}

impl std::fmt::Display for InstallPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallPass::Bootstrap => write!(f, "bootstrap"),
            InstallPass::General => write!(f, "general"),
        }
    }
}

/// The response did not come from the invocation that was issued.
#[derive(Debug, Error)]
#[error("trace id mismatch at step {step}: sent {expected}, received {}", actual.as_deref().unwrap_or("<none>"))]
pub struct ProtocolError {
    pub step: u32,
    pub expected: String,
    pub actual: Option<String>,
    pub history: Vec<StepRecord>,
}

/// The output tape was missing, malformed, or named no valid next step.
#[derive(Debug, Error)]
#[error("invalid response at step {step}: {reason}")]
pub struct InvalidResponseError {
    pub step: u32,
    pub reason: String,
    pub history: Vec<StepRecord>,
}

/// Progress failed to increase for too many consecutive steps.
#[derive(Debug, Error)]
#[error("workflow stagnated at step {step}: {threshold} consecutive steps without progress")]
pub struct WorkflowStagnationError {
    pub step: u32,
    pub threshold: u32,
    pub history: Vec<StepRecord>,
}

/// The chain ran out of steps before completing.
#[derive(Debug, Error)]
#[error("workflow exceeded {max_steps} steps without completing")]
pub struct WorkflowStepLimitError {
    pub max_steps: u32,
    pub history: Vec<StepRecord>,
}

/// A single agent invocation outlived the configured step timeout.
#[derive(Debug, Error)]
#[error("step {step} ({agent}) exceeded timeout of {timeout_ms} ms")]
pub struct StepTimeoutError {
    pub step: u32,
    pub agent: String,
    pub timeout_ms: u64,
    pub history: Vec<StepRecord>,
}
