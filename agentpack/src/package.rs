//! Artifact packaging: canonical code and dependency trees → deterministic
//! archives + manifests under `dist/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::{AgentDescriptor, AgentRegistry};
use crate::error::PackagingError;
use crate::io::archive::{collect_files, write_archive};
use crate::io::config::AgentpackConfig;
use crate::io::discover::{Discovery, discover};
use crate::io::events::{EventSink, Level, StageEvents};
use crate::io::manifest::{
    ArchiveManifest, VENDOR_MANIFEST_FILE, VendorManifest, read_vendor_manifest, write_json,
};
use crate::io::registry::{REGISTRY_FILE, write_registry};

pub const CODE_ARCHIVE: &str = "code.tar.gz";
pub const CODE_MANIFEST: &str = "code.manifest.json";
pub const DEPS_ARCHIVE: &str = "deps.tar.gz";
pub const DEPS_MANIFEST: &str = "deps.manifest.json";
/// Directory of package files inside the dependency tree.
pub const PACKAGES_DIR: &str = "packages";

const STAGING_DIR: &str = ".staging";
const SKIPPED_DIRS: [&str; 2] = ["__pycache__", ".git"];

/// Archive + manifest pair of one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub archive: PathBuf,
    pub manifest: PathBuf,
}

impl ArtifactPaths {
    pub fn code(dist: &Path) -> Self {
        Self {
            archive: dist.join(CODE_ARCHIVE),
            manifest: dist.join(CODE_MANIFEST),
        }
    }

    pub fn deps(dist: &Path) -> Self {
        Self {
            archive: dist.join(DEPS_ARCHIVE),
            manifest: dist.join(DEPS_MANIFEST),
        }
    }

    /// Delete the manifest first, then the archive, ignoring absent files.
    fn remove(&self) -> Result<()> {
        for path in [&self.manifest, &self.archive] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).with_context(|| format!("remove {}", path.display())),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PackageOutcome {
    pub code: ArtifactPaths,
    pub code_manifest: ArchiveManifest,
    pub deps: ArtifactPaths,
    pub deps_manifest: ArchiveManifest,
}

/// Package the workspace at `root` using the vendor manifest of an earlier
/// vendoring pass.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn package(root: &Path, cfg: &AgentpackConfig, sink: &dyn EventSink) -> Result<PackageOutcome> {
    let discovery = discover(root, &cfg.vendor.bootstrap_set(), sink)?;
    let vendor_dir = cfg.vendor_dir(root);
    let vendor = read_vendor_manifest(&vendor_dir.join(VENDOR_MANIFEST_FILE))
        .context("load vendor manifest (run `agentpack vendor` first)")?;

    let dist = cfg.dist_dir(root);
    let staging = dist.join(STAGING_DIR);
    reset_dir(&staging)?;
    let result = package_into(root, cfg, &discovery, &vendor, &dist, &staging, sink);
    if let Err(err) = fs::remove_dir_all(&staging) {
        debug!(err = %err, "could not remove staging dir");
    }
    result
}

fn package_into(
    root: &Path,
    cfg: &AgentpackConfig,
    discovery: &Discovery,
    vendor: &VendorManifest,
    dist: &Path,
    staging: &Path,
    sink: &dyn EventSink,
) -> Result<PackageOutcome> {
    let events = StageEvents::new(sink, "package");
    let code = ArtifactPaths::code(dist);
    let deps = ArtifactPaths::deps(dist);
    // A failed pass must not leave one fresh artifact next to a stale one.
    code.remove()?;
    deps.remove()?;

    let code_tree = staging.join("code");
    build_code_tree(&cfg.runtime_dir(root), discovery, &code_tree)?;
    let deps_tree = staging.join("deps");
    build_deps_tree(&cfg.vendor_dir(root), vendor, &deps_tree)?;

    let code_manifest = seal(&code_tree, &code, ArchiveManifest::new(&cfg.runtime, CODE_ARCHIVE, Vec::new()))?;
    emit_written(&events, &code_manifest);
    let mut deps_manifest = ArchiveManifest::new(&cfg.runtime, DEPS_ARCHIVE, Vec::new());
    deps_manifest.merge_vendor(vendor);
    let deps_manifest = seal(&deps_tree, &deps, deps_manifest)?;
    emit_written(&events, &deps_manifest);

    Ok(PackageOutcome {
        code,
        code_manifest,
        deps,
        deps_manifest,
    })
}

/// Lay out `runtime/`, `agents/<name>/` and `registry.json` under `tree`.
pub fn build_code_tree(runtime_dir: &Path, discovery: &Discovery, tree: &Path) -> Result<AgentRegistry> {
    fs::create_dir_all(tree).with_context(|| format!("create {}", tree.display()))?;
    if runtime_dir.is_dir() {
        copy_tree(runtime_dir, &tree.join("runtime"))?;
    }
    let mut agents = Vec::with_capacity(discovery.agents.len());
    for agent in &discovery.agents {
        let source = Path::new(&agent.source_dir);
        if !source.is_dir() {
            return Err(PackagingError::MissingSource {
                path: source.to_path_buf(),
            }
            .into());
        }
        let rel = format!("agents/{}", agent.name);
        copy_tree(source, &tree.join(&rel))?;
        agents.push(AgentDescriptor {
            name: agent.name.clone(),
            source_dir: rel,
            module_path: agent.module_path.clone(),
        });
    }
    let registry = AgentRegistry {
        agents,
        root_agent: discovery.root_agent.clone(),
    };
    write_registry(&tree.join(REGISTRY_FILE), &registry)?;
    Ok(registry)
}

/// Lay out `packages/<file_name>` for every vendored package.
pub fn build_deps_tree(vendor_dir: &Path, vendor: &VendorManifest, tree: &Path) -> Result<()> {
    let packages = tree.join(PACKAGES_DIR);
    fs::create_dir_all(&packages).with_context(|| format!("create {}", packages.display()))?;
    for (package, filename) in &vendor.package_files {
        let source = vendor_dir.join(filename);
        if !source.is_file() {
            return Err(PackagingError::MissingPackageFile {
                package: package.clone(),
                filename: filename.clone(),
                dir: vendor_dir.to_path_buf(),
            }
            .into());
        }
        fs::copy(&source, packages.join(filename))
            .with_context(|| format!("copy {}", source.display()))?;
    }
    Ok(())
}

/// Archive `tree` and write the completed manifest next to it.
fn seal(tree: &Path, paths: &ArtifactPaths, mut manifest: ArchiveManifest) -> Result<ArchiveManifest> {
    let summary = write_archive(tree, &paths.archive)?;
    manifest.files = summary.files;
    manifest.archive_sha256 = summary.sha256;
    manifest.archive_size = Some(summary.size);
    write_json(&paths.manifest, &manifest)?;
    Ok(manifest)
}

fn emit_written(events: &StageEvents<'_>, manifest: &ArchiveManifest) {
    events.emit(
        events
            .record(Level::Info, "archive_written")
            .field("archive", manifest.archive.clone())
            .field("sha256", manifest.archive_sha256.clone())
            .field("entries", manifest.files.len()),
    );
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for (rel, path) in collect_files(src)? {
        if rel.split('/').any(|part| SKIPPED_DIRS.contains(&part)) {
            continue;
        }
        let target = dst.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(&path, &target).with_context(|| format!("copy {}", path.display()))?;
    }
    Ok(())
}

fn reset_dir(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::archive::file_sha256;
    use crate::io::events::TracingEventSink;
    use crate::io::manifest::{FileEntry, read_archive_manifest};
    use std::collections::BTreeMap;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write");
    }

    fn workspace(root: &Path) {
        write(&root.join("agent/main.py"), "def main(config): ...\n");
        write(&root.join("agent/__pycache__/main.cpython-312.pyc"), "junk");
        write(&root.join("agent-multiplier/main.py"), "def main(config): ...\n");
        write(&root.join("runtime/bootstrap.py"), "# host shim\n");
        write(&root.join("vendor/micropip.whl"), "micropip bytes");
        write(&root.join("vendor/packaging.whl"), "packaging bytes");
        let vendor = VendorManifest {
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            runtime: "pyodide".to_string(),
            runtime_version: "0.26.1".to_string(),
            language: "python".to_string(),
            language_version: "3.12.1".to_string(),
            requested_packages: vec!["micropip".to_string(), "packaging".to_string()],
            resolved_packages: vec!["micropip".to_string(), "packaging".to_string()],
            missing_packages: Vec::new(),
            failed_packages: BTreeMap::new(),
            package_files: BTreeMap::from([
                ("micropip".to_string(), "micropip.whl".to_string()),
                ("packaging".to_string(), "packaging.whl".to_string()),
            ]),
            files: Vec::<FileEntry>::new(),
        };
        write_json(&root.join("vendor").join(VENDOR_MANIFEST_FILE), &vendor).expect("vendor manifest");
    }

    #[test]
    fn writes_both_artifacts_with_manifests() {
        let temp = tempfile::tempdir().expect("tempdir");
        workspace(temp.path());
        let cfg = AgentpackConfig::default();
        let outcome = package(temp.path(), &cfg, &TracingEventSink).expect("package");

        let code = read_archive_manifest(&outcome.code.manifest).expect("code manifest");
        assert_eq!(code.archive, CODE_ARCHIVE);
        assert_eq!(code.archive_sha256, file_sha256(&outcome.code.archive).expect("hash"));
        let names: Vec<&str> = code.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "agents/multiplier/main.py",
                "agents/root/main.py",
                "registry.json",
                "runtime/bootstrap.py"
            ]
        );
        assert!(code.resolved_packages.is_none());

        let deps = read_archive_manifest(&outcome.deps.manifest).expect("deps manifest");
        assert_eq!(
            deps.resolved_packages,
            Some(vec!["micropip".to_string(), "packaging".to_string()])
        );
        assert_eq!(deps.files.len(), 2);
        assert!(!temp.path().join("dist/.staging").exists());
    }

    #[test]
    fn repackaging_is_byte_identical() {
        let temp = tempfile::tempdir().expect("tempdir");
        workspace(temp.path());
        let cfg = AgentpackConfig::default();
        let first = package(temp.path(), &cfg, &TracingEventSink).expect("first");
        let second = package(temp.path(), &cfg, &TracingEventSink).expect("second");
        assert_eq!(
            first.code_manifest.archive_sha256,
            second.code_manifest.archive_sha256
        );
        assert_eq!(
            first.deps_manifest.archive_sha256,
            second.deps_manifest.archive_sha256
        );
    }

    #[test]
    fn missing_vendored_file_is_a_packaging_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        workspace(temp.path());
        fs::remove_file(temp.path().join("vendor/packaging.whl")).expect("remove");
        let err = package(temp.path(), &AgentpackConfig::default(), &TracingEventSink).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PackagingError>(),
            Some(PackagingError::MissingPackageFile { .. })
        ));
    }

    #[test]
    fn failed_repackage_leaves_nothing_that_verifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        workspace(temp.path());
        let cfg = AgentpackConfig::default();
        package(temp.path(), &cfg, &TracingEventSink).expect("first");

        write(&temp.path().join("agent/main.py"), "def main(config): return 1\n");
        fs::remove_file(temp.path().join("vendor/packaging.whl")).expect("remove");
        package(temp.path(), &cfg, &TracingEventSink).unwrap_err();

        let dist = temp.path().join("dist");
        assert!(!dist.join(CODE_ARCHIVE).exists());
        assert!(!dist.join(DEPS_MANIFEST).exists());
        let err = crate::verify::verify_dist(&dist, &TracingEventSink).unwrap_err();
        assert!(err.downcast_ref::<crate::error::IntegrityError>().is_some());
    }
}
