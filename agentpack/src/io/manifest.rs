//! Archive and vendor manifests persisted next to the artifacts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::io::config::RuntimeConfig;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;
pub const VENDOR_MANIFEST_FILE: &str = "vendor_manifest.json";

/// Size and hash of one file inside an artifact tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the tree root, `/`-separated.
    pub filename: String,
    pub size: u64,
    pub sha256: String,
}

/// Integrity record for one `.tar.gz` artifact.
///
/// Written once at packaging time. The verifier trusts nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub schema_version: u32,
    pub runtime: String,
    pub runtime_version: String,
    pub language: String,
    pub language_version: String,
    /// Archive file name, relative to the manifest.
    pub archive: String,
    #[serde(default)]
    pub archive_sha256: String,
    #[serde(default)]
    pub archive_size: Option<u64>,
    pub files: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_files: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendored_at: Option<String>,
}

impl ArchiveManifest {
    pub fn new(runtime: &RuntimeConfig, archive: &str, files: Vec<FileEntry>) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            runtime: runtime.name.clone(),
            runtime_version: runtime.version.clone(),
            language: runtime.language.clone(),
            language_version: runtime.language_version.clone(),
            archive: archive.to_string(),
            archive_sha256: String::new(),
            archive_size: None,
            files,
            requested_packages: None,
            resolved_packages: None,
            package_files: None,
            missing_packages: None,
            vendored_at: None,
        }
    }

    /// Copy the vendoring record into a dependency artifact manifest.
    pub fn merge_vendor(&mut self, vendor: &VendorManifest) {
        self.requested_packages = Some(vendor.requested_packages.clone());
        self.resolved_packages = Some(vendor.resolved_packages.clone());
        self.package_files = Some(vendor.package_files.clone());
        self.missing_packages = Some(vendor.missing_packages.clone());
        self.vendored_at = Some(vendor.timestamp.clone());
    }
}

/// Record of one vendoring pass, written to `vendor/vendor_manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorManifest {
    pub timestamp: String,
    pub runtime: String,
    pub runtime_version: String,
    pub language: String,
    pub language_version: String,
    pub requested_packages: Vec<String>,
    pub resolved_packages: Vec<String>,
    pub missing_packages: Vec<String>,
    /// Package name → last failure reason.
    #[serde(default)]
    pub failed_packages: BTreeMap<String, String>,
    /// Package name → vendored file name.
    pub package_files: BTreeMap<String, String>,
    pub files: Vec<FileEntry>,
}

pub fn read_archive_manifest(path: &Path) -> Result<ArchiveManifest> {
    read_json(path)
}

pub fn read_vendor_manifest(path: &Path) -> Result<VendorManifest> {
    read_json(path)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Pretty JSON with a trailing newline, written via temp file + rename.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_manifest_omits_vendor_fields() {
        let manifest = ArchiveManifest::new(&RuntimeConfig::default(), "code.tar.gz", Vec::new());
        let value = serde_json::to_value(&manifest).expect("serialize");
        let object = value.as_object().expect("object");
        assert!(!object.contains_key("resolved_packages"));
        assert!(!object.contains_key("vendored_at"));
        assert_eq!(value["runtime"], "pyodide");
        assert_eq!(value["language_version"], "3.12.1");
    }

    #[test]
    fn manifest_without_hash_still_parses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("m.json");
        fs::write(
            &path,
            r#"{"schema_version":1,"runtime":"r","runtime_version":"1","language":"l",
               "language_version":"2","archive":"code.tar.gz","files":[]}"#,
        )
        .expect("write");
        let manifest = read_archive_manifest(&path).expect("read");
        assert!(manifest.archive_sha256.is_empty());
        assert_eq!(manifest.archive_size, None);
    }

    #[test]
    fn merge_vendor_copies_package_lists() {
        let vendor = VendorManifest {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            runtime: "pyodide".to_string(),
            runtime_version: "0.26.1".to_string(),
            language: "python".to_string(),
            language_version: "3.12.1".to_string(),
            requested_packages: vec!["numpy".to_string()],
            resolved_packages: vec!["numpy".to_string()],
            missing_packages: vec!["ghost".to_string()],
            failed_packages: BTreeMap::new(),
            package_files: BTreeMap::from([("numpy".to_string(), "numpy.whl".to_string())]),
            files: Vec::new(),
        };
        let mut manifest = ArchiveManifest::new(&RuntimeConfig::default(), "deps.tar.gz", Vec::new());
        manifest.merge_vendor(&vendor);
        assert_eq!(manifest.missing_packages, Some(vec!["ghost".to_string()]));
        assert_eq!(manifest.vendored_at.as_deref(), Some("2026-01-01T00:00:00Z"));
        let written = temp_round_trip(&manifest);
        assert_eq!(written, manifest);
    }

    fn temp_round_trip(manifest: &ArchiveManifest) -> ArchiveManifest {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("deps.manifest.json");
        write_json(&path, manifest).expect("write");
        read_archive_manifest(&path).expect("read")
    }
}
