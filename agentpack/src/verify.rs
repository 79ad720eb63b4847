//! Fail-closed artifact verification.
//!
//! An archive is accepted only when its recomputed SHA-256 equals the
//! manifest's `archive_sha256`. There is no degraded mode: anything missing,
//! unreadable or different is an [`IntegrityError`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::instrument;

use crate::error::IntegrityError;
use crate::io::archive::{describe_tree, file_sha256};
use crate::io::events::{EventSink, Level, StageEvents};
use crate::io::manifest::{ArchiveManifest, read_archive_manifest};
use crate::package::ArtifactPaths;

/// Both manifests of a verified `dist/`.
#[derive(Debug, Clone)]
pub struct VerifiedArtifacts {
    pub code: ArchiveManifest,
    pub deps: ArchiveManifest,
}

/// Check one archive against its manifest before anything is unpacked.
#[instrument(skip_all, fields(archive = %archive.display()))]
pub fn verify_artifact(archive: &Path, manifest_path: &Path) -> Result<ArchiveManifest> {
    if !manifest_path.is_file() {
        return Err(IntegrityError::Missing {
            kind: "manifest",
            path: manifest_path.to_path_buf(),
        }
        .into());
    }
    if !archive.is_file() {
        return Err(IntegrityError::Missing {
            kind: "archive",
            path: archive.to_path_buf(),
        }
        .into());
    }
    let manifest = read_archive_manifest(manifest_path).map_err(|err| IntegrityError::InvalidManifest {
        path: manifest_path.to_path_buf(),
        reason: format!("{err:#}"),
    })?;
    if manifest.archive_sha256.trim().is_empty() {
        return Err(IntegrityError::NoExpectedHash {
            path: manifest_path.to_path_buf(),
        }
        .into());
    }

    if let Some(expected) = manifest.archive_size {
        let actual = fs::metadata(archive)
            .map_err(|err| unreadable(archive, &anyhow::Error::from(err)))?
            .len();
        if actual != expected {
            return Err(IntegrityError::SizeMismatch {
                path: archive.to_path_buf(),
                expected,
                actual,
            }
            .into());
        }
    }

    let actual = file_sha256(archive).map_err(|err| unreadable(archive, &err))?;
    if actual != manifest.archive_sha256 {
        return Err(IntegrityError::HashMismatch {
            path: archive.to_path_buf(),
            expected: manifest.archive_sha256.clone(),
            actual,
        }
        .into());
    }
    Ok(manifest)
}

/// Verify the code and dependency artifacts in `dist`.
pub fn verify_dist(dist: &Path, sink: &dyn EventSink) -> Result<VerifiedArtifacts> {
    let events = StageEvents::new(sink, "verify");
    let code = verify_reporting(&events, &ArtifactPaths::code(dist))?;
    let deps = verify_reporting(&events, &ArtifactPaths::deps(dist))?;
    Ok(VerifiedArtifacts { code, deps })
}

fn verify_reporting(events: &StageEvents<'_>, paths: &ArtifactPaths) -> Result<ArchiveManifest> {
    let archive = paths.archive.display().to_string();
    match verify_artifact(&paths.archive, &paths.manifest) {
        Ok(manifest) => {
            events.emit(
                events
                    .record(Level::Info, "artifact_verified")
                    .field("archive", archive)
                    .field("sha256", manifest.archive_sha256.clone()),
            );
            Ok(manifest)
        }
        Err(err) => {
            events.emit(
                events
                    .record(Level::Error, "artifact_rejected")
                    .field("archive", archive)
                    .field("reason", format!("{err:#}")),
            );
            Err(err)
        }
    }
}

/// Compare an unpacked tree file by file with the manifest. Extra files are
/// rejected as well as missing or altered ones.
pub fn verify_unpacked_tree(manifest: &ArchiveManifest, dir: &Path) -> Result<()> {
    let mut actual: BTreeMap<String, _> = describe_tree(dir)
        .map_err(|err| unreadable(dir, &err))?
        .into_iter()
        .map(|entry| (entry.filename.clone(), entry))
        .collect();
    for expected in &manifest.files {
        let Some(found) = actual.remove(&expected.filename) else {
            return Err(IntegrityError::FileMismatch {
                filename: expected.filename.clone(),
                detail: "missing from unpacked tree".to_string(),
            }
            .into());
        };
        if found.size != expected.size {
            return Err(IntegrityError::FileMismatch {
                filename: expected.filename.clone(),
                detail: format!("size {} != {}", found.size, expected.size),
            }
            .into());
        }
        if found.sha256 != expected.sha256 {
            return Err(IntegrityError::FileMismatch {
                filename: expected.filename.clone(),
                detail: format!("sha256 {} != {}", found.sha256, expected.sha256),
            }
            .into());
        }
    }
    if let Some(extra) = actual.into_keys().next() {
        return Err(IntegrityError::UnexpectedFile { filename: extra }.into());
    }
    Ok(())
}

fn unreadable(path: &Path, err: &anyhow::Error) -> IntegrityError {
    IntegrityError::Unreadable {
        path: path.to_path_buf(),
        reason: format!("{err:#}"),
    }
}
