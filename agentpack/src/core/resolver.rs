//! Transitive closure of requested packages over the catalog graph.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// One installable unit from the pre-published catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub file_name: String,
    /// Direct dependencies (normalised names).
    pub depends: BTreeSet<String>,
    /// Expected SHA-256 of `file_name`, when the catalog publishes one.
    pub sha256: Option<String>,
}

/// Catalog keyed by normalised package name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    /// Catalog release version (used to build the download location).
    pub version: String,
    /// Language version the catalog was built for.
    pub language_version: String,
    pub packages: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.packages.get(name)
    }
}

/// Result of closing a requested set over the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedClosure {
    /// Every catalog name reachable from the requested roots.
    pub packages: BTreeSet<String>,
    /// Names referenced (requested or depended on) but absent from the catalog.
    pub missing: BTreeSet<String>,
}

impl ResolvedClosure {
    /// Sorted closure list used for deterministic downstream ordering.
    pub fn sorted(&self) -> Vec<String> {
        self.packages.iter().cloned().collect()
    }
}

/// Compute the closure with an explicit work stack and a visited set.
///
/// Cycles and arbitrarily deep chains terminate because every name is expanded
/// at most once. Names absent from the catalog are excluded and reported in
/// `missing`; nothing is substituted for them.
pub fn resolve_closure<'a, I>(requested: I, catalog: &Catalog) -> ResolvedClosure
where
    I: IntoIterator<Item = &'a String>,
{
    let mut closure = ResolvedClosure::default();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = requested.into_iter().cloned().collect();

    while let Some(name) = stack.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let Some(entry) = catalog.get(&name) else {
            closure.missing.insert(name);
            continue;
        };
        closure.packages.insert(name);
        for dep in &entry.depends {
            if !visited.contains(dep) {
                stack.push(dep.clone());
            }
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(edges: &[(&str, &[&str])]) -> Catalog {
        let packages = edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    CatalogEntry {
                        name: name.to_string(),
                        file_name: format!("{name}-1.0.tar.gz"),
                        depends: deps.iter().map(|d| d.to_string()).collect(),
                        sha256: None,
                    },
                )
            })
            .collect();
        Catalog {
            version: "0.1.0".to_string(),
            language_version: "3.12".to_string(),
            packages,
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn follows_transitive_edges() {
        let cat = catalog(&[
            ("pandas", &["numpy", "python-dateutil"]),
            ("numpy", &[]),
            ("python-dateutil", &["six"]),
            ("six", &[]),
            ("unrelated", &[]),
        ]);
        let requested = names(&["pandas"]);
        let closure = resolve_closure(&requested, &cat);
        assert_eq!(
            closure.sorted(),
            names(&["numpy", "pandas", "python-dateutil", "six"])
        );
        assert!(closure.missing.is_empty());
    }

    #[test]
    fn cycles_terminate_without_duplicates() {
        let cat = catalog(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let requested = names(&["a", "c"]);
        let closure = resolve_closure(&requested, &cat);
        assert_eq!(closure.sorted(), names(&["a", "b", "c"]));
    }

    #[test]
    fn absent_names_are_excluded_and_reported() {
        let cat = catalog(&[("a", &["ghost"]), ("b", &[])]);
        let requested = names(&["a", "nowhere"]);
        let closure = resolve_closure(&requested, &cat);
        assert_eq!(closure.sorted(), names(&["a"]));
        assert_eq!(
            closure.missing.into_iter().collect::<Vec<_>>(),
            names(&["ghost", "nowhere"])
        );
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let chain: Vec<(String, Vec<String>)> = (0..50_000)
            .map(|i| (format!("p{i}"), vec![format!("p{}", i + 1)]))
            .collect();
        let mut cat = Catalog::default();
        for (name, deps) in &chain {
            cat.packages.insert(
                name.clone(),
                CatalogEntry {
                    name: name.clone(),
                    file_name: format!("{name}.tar.gz"),
                    depends: deps.iter().cloned().collect(),
                    sha256: None,
                },
            );
        }
        let requested = names(&["p0"]);
        let closure = resolve_closure(&requested, &cat);
        assert_eq!(closure.packages.len(), 50_000);
        assert!(closure.missing.contains("p50000"));
    }

    #[test]
    fn result_is_independent_of_request_order() {
        let cat = catalog(&[("x", &["y"]), ("y", &[]), ("z", &["x"])]);
        let forward = resolve_closure(&names(&["x", "z"]), &cat);
        let backward = resolve_closure(&names(&["z", "x"]), &cat);
        assert_eq!(forward, backward);
    }
}
