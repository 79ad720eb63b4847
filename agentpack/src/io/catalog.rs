//! Package catalog (lock file) loading.
//!
//! The catalog is an external, pre-published JSON document:
//!
//! ```json
//! {
//!   "info": {"version": "0.26.1", "python": "3.12.1"},
//!   "packages": {
//!     "numpy": {"name": "numpy", "file_name": "numpy-1.26.4.whl", "depends": []}
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::debug;

use crate::core::requirements::normalize_name;
use crate::core::resolver::{Catalog, CatalogEntry};

#[derive(Debug, Deserialize)]
struct RawCatalog {
    info: RawInfo,
    packages: BTreeMap<String, RawPackage>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    version: String,
    python: String,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    file_name: String,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    sha256: Option<String>,
}

/// Parse catalog JSON, normalising every package and dependency name.
pub fn parse_catalog(contents: &str) -> Result<Catalog> {
    let raw: RawCatalog = serde_json::from_str(contents).context("parse catalog json")?;
    let mut packages = BTreeMap::new();
    for (key, pkg) in raw.packages {
        let name = normalize_name(&key);
        if pkg.file_name.trim().is_empty() {
            return Err(anyhow!("catalog package '{key}' has empty file_name"));
        }
        if pkg.file_name.contains('/') || pkg.file_name.contains('\\') {
            return Err(anyhow!(
                "catalog package '{key}' file_name must not contain path separators"
            ));
        }
        let depends: BTreeSet<String> = pkg.depends.iter().map(|d| normalize_name(d)).collect();
        let entry = CatalogEntry {
            name: name.clone(),
            file_name: pkg.file_name,
            depends,
            sha256: pkg.sha256.filter(|hash| !hash.trim().is_empty()),
        };
        if packages.insert(name.clone(), entry).is_some() {
            return Err(anyhow!("catalog lists '{name}' more than once after normalisation"));
        }
    }
    Ok(Catalog {
        version: raw.info.version,
        language_version: raw.info.python,
        packages,
    })
}

/// Load a catalog file from disk.
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    debug!(path = %path.display(), "loading catalog");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let catalog =
        parse_catalog(&contents).with_context(|| format!("load catalog {}", path.display()))?;
    debug!(packages = catalog.packages.len(), version = %catalog.version, "catalog loaded");
    Ok(catalog)
}

/// Download location for a catalog: the template with `{version}` substituted,
/// always ending in `/`.
pub fn download_base(template: &str, catalog: &Catalog) -> String {
    let mut base = template.replace("{version}", &catalog.version);
    if !base.ends_with('/') {
        base.push('/');
    }
    base
}
