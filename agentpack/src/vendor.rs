//! Dependency vendoring: discover → resolve → download.
//!
//! Every package of the resolved closure is fetched into the vendor directory
//! and recorded in `vendor_manifest.json`. A failed download does not stop the
//! pass; it lands in `failed_packages`. Only a bootstrap package that is
//! missing from the catalog or failed to download is fatal, since the sandbox
//! installer cannot work without it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{info, instrument, warn};

use crate::core::resolver::{Catalog, CatalogEntry, ResolvedClosure, resolve_closure};
use crate::error::{DownloadError, VendorError};
use crate::io::archive::file_sha256;
use crate::io::catalog::download_base;
use crate::io::config::AgentpackConfig;
use crate::io::discover::{Discovery, discover};
use crate::io::events::{EventSink, Level, StageEvents};
use crate::io::fetch::{Fetcher, RetryPolicy, fetch_with_retry, sha256_hex};
use crate::io::manifest::{FileEntry, VENDOR_MANIFEST_FILE, VendorManifest, write_json};

/// What one vendoring pass produced.
#[derive(Debug, Clone)]
pub struct VendorOutcome {
    pub manifest: VendorManifest,
    pub manifest_path: PathBuf,
    pub discovery: Discovery,
}

/// Resolve `requested` against the catalog, reporting every gap.
///
/// Gaps are warnings: the build continues without the missing names.
pub fn resolve(
    requested: &BTreeSet<String>,
    catalog: &Catalog,
    sink: &dyn EventSink,
) -> ResolvedClosure {
    let events = StageEvents::new(sink, "resolve");
    let closure = resolve_closure(requested, catalog);
    for name in &closure.missing {
        warn!(package = %name, "package not found in catalog");
        events.emit(
            events
                .record(Level::Warn, "catalog_gap")
                .field("package", name.clone()),
        );
    }
    events.emit(
        events
            .record(Level::Info, "closure_resolved")
            .field("requested", requested.len())
            .field("resolved", closure.packages.len())
            .field("missing", closure.missing.len()),
    );
    closure
}

/// Vendor every dependency of the workspace at `root`.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn vendor(
    root: &Path,
    cfg: &AgentpackConfig,
    catalog: &Catalog,
    fetcher: &dyn Fetcher,
    sink: &dyn EventSink,
) -> Result<VendorOutcome> {
    let bootstrap = cfg.vendor.bootstrap_set();
    let discovery = discover(root, &bootstrap, sink)?;
    let closure = resolve(&discovery.requested, catalog, sink);

    if catalog.version != cfg.runtime.version {
        warn!(
            catalog = %catalog.version,
            configured = %cfg.runtime.version,
            "catalog version differs from runtime.version"
        );
    }

    let events = StageEvents::new(sink, "vendor");
    let vendor_dir = cfg.vendor_dir(root);
    fs::create_dir_all(&vendor_dir)
        .with_context(|| format!("create vendor dir {}", vendor_dir.display()))?;
    let base = download_base(&cfg.vendor.download_base, catalog);
    let policy = cfg.vendor.retry_policy();

    let mut package_files = BTreeMap::new();
    let mut files = Vec::new();
    let mut failures: Vec<DownloadError> = Vec::new();
    for name in closure.sorted() {
        let Some(entry) = catalog.get(&name) else {
            continue;
        };
        let target = vendor_dir.join(&entry.file_name);
        match vendor_one(fetcher, entry, &base, &target, &policy) {
            Ok(VendorAction { reused, file }) => {
                events.emit(
                    events
                        .record(Level::Info, if reused { "package_reused" } else { "package_downloaded" })
                        .field("package", name.clone())
                        .field("file", entry.file_name.clone())
                        .field("size", file.size),
                );
                package_files.insert(name.clone(), entry.file_name.clone());
                files.push(file);
            }
            Err(err) => {
                events.emit(
                    events
                        .record(Level::Error, "package_failed")
                        .field("package", name.clone())
                        .field("url", err.url.clone())
                        .field("attempts", err.attempts.clone()),
                );
                failures.push(err);
            }
        }
    }

    let manifest = VendorManifest {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        runtime: cfg.runtime.name.clone(),
        runtime_version: cfg.runtime.version.clone(),
        language: cfg.runtime.language.clone(),
        language_version: cfg.runtime.language_version.clone(),
        requested_packages: discovery.requested.iter().cloned().collect(),
        resolved_packages: closure.sorted(),
        missing_packages: closure.missing.iter().cloned().collect(),
        failed_packages: failures
            .iter()
            .map(|err| (err.package.clone(), err.to_string()))
            .collect(),
        package_files,
        files,
    };
    let manifest_path = vendor_dir.join(VENDOR_MANIFEST_FILE);
    write_json(&manifest_path, &manifest)?;
    info!(
        resolved = manifest.resolved_packages.len(),
        vendored = manifest.package_files.len(),
        failed = failures.len(),
        "vendor manifest written"
    );

    let uncatalogued: Vec<String> = closure
        .missing
        .iter()
        .filter(|name| bootstrap.contains(*name))
        .cloned()
        .collect();
    let mut unavailable: BTreeSet<String> = uncatalogued.iter().cloned().collect();
    unavailable.extend(
        failures
            .iter()
            .filter(|err| bootstrap.contains(&err.package))
            .map(|err| err.package.clone()),
    );
    if !unavailable.is_empty() {
        let unavailable: Vec<String> = unavailable.into_iter().collect();
        events.emit(
            events
                .record(Level::Error, "bootstrap_unavailable")
                .field("packages", unavailable.clone()),
        );
        return Err(VendorError {
            bootstrap: unavailable,
            uncatalogued,
            failures,
        }
        .into());
    }
    events.info("vendor_complete");

    Ok(VendorOutcome {
        manifest,
        manifest_path,
        discovery,
    })
}

struct VendorAction {
    reused: bool,
    file: FileEntry,
}

fn vendor_one(
    fetcher: &dyn Fetcher,
    entry: &CatalogEntry,
    base: &str,
    target: &Path,
    policy: &RetryPolicy,
) -> std::result::Result<VendorAction, DownloadError> {
    let url = format!("{base}{}", entry.file_name);
    if let Some(file) = reusable(entry, target) {
        return Ok(VendorAction { reused: true, file });
    }
    let body = fetch_with_retry(fetcher, &entry.name, &url, entry.sha256.as_deref(), policy)?;
    let sha256 = sha256_hex(&body);
    store(target, &body).map_err(|err| DownloadError {
        package: entry.name.clone(),
        url: url.clone(),
        attempts: vec![format!("store {}: {err:#}", target.display())],
    })?;
    Ok(VendorAction {
        reused: false,
        file: FileEntry {
            filename: entry.file_name.clone(),
            size: body.len() as u64,
            sha256,
        },
    })
}

/// A previously vendored file is kept when it matches the catalog hash, or,
/// without one, when it is non-empty.
fn reusable(entry: &CatalogEntry, target: &Path) -> Option<FileEntry> {
    let size = fs::metadata(target).ok()?.len();
    if size == 0 {
        return None;
    }
    let sha256 = file_sha256(target).ok()?;
    if let Some(expected) = &entry.sha256
        && !expected.eq_ignore_ascii_case(&sha256)
    {
        return None;
    }
    Some(FileEntry {
        filename: entry.file_name.clone(),
        size,
        sha256,
    })
}

fn store(target: &Path, body: &[u8]) -> Result<()> {
    let mut tmp_name = target.as_os_str().to_os_string();
    tmp_name.push(".part");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, body).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, target).with_context(|| format!("rename into {}", target.display()))?;
    Ok(())
}
