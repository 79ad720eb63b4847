//! Deterministic `.tar.gz` serialization of artifact trees, and extraction of
//! artifacts and package files.
//!
//! Entries are sorted by relative path and carry fixed header metadata, and
//! the gzip header has no timestamp or file name, so identical trees produce
//! byte-identical archives. Package files are wheels (zip) or `.tar.gz`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, instrument};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::PackagingError;
use crate::io::manifest::FileEntry;

const ENTRY_MODE: u32 = 0o644;

/// What was written for one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    /// Files in archive order.
    pub files: Vec<FileEntry>,
}

/// Regular files under `root`, as (relative `/`-separated path, absolute path),
/// sorted by relative path. Symlinks and other special files are skipped.
pub fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("strip prefix {}", root.display()))?;
        let rel = rel
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((rel, entry.path().to_path_buf()));
    }
    files.sort_by(|left, right| left.0.cmp(&right.0));
    Ok(files)
}

/// Hex SHA-256 of a file on disk, streamed.
pub fn file_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Size and hash of every regular file under `root`.
pub fn describe_tree(root: &Path) -> Result<Vec<FileEntry>> {
    collect_files(root)?
        .into_iter()
        .map(|(filename, path)| {
            let size = fs::metadata(&path)
                .with_context(|| format!("stat {}", path.display()))?
                .len();
            Ok(FileEntry {
                filename,
                size,
                sha256: file_sha256(&path)?,
            })
        })
        .collect()
}

/// Serialize `tree` into a deterministic `.tar.gz` at `out`.
///
/// The archive is written under a temporary name, reopened and checked for at
/// least one entry, and only then renamed into place.
#[instrument(skip_all, fields(tree = %tree.display(), out = %out.display()))]
pub fn write_archive(tree: &Path, out: &Path) -> Result<ArchiveSummary> {
    let files = collect_files(tree)?;
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp_path = temp_path_for(out)?;
    let result = write_entries(&files, &tmp_path).and_then(|entries| {
        let count = count_entries(&tmp_path)?;
        if count == 0 {
            return Err(PackagingError::EmptyArchive {
                path: out.to_path_buf(),
            }
            .into());
        }
        Ok(entries)
    });
    let entries = match result {
        Ok(entries) => entries,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
    };
    fs::rename(&tmp_path, out).with_context(|| format!("rename into {}", out.display()))?;

    let size = fs::metadata(out)
        .with_context(|| format!("stat {}", out.display()))?
        .len();
    let sha256 = file_sha256(out)?;
    debug!(entries = entries.len(), size, %sha256, "archive written");
    Ok(ArchiveSummary {
        path: out.to_path_buf(),
        sha256,
        size,
        files: entries,
    })
}

fn write_entries(files: &[(String, PathBuf)], tmp_path: &Path) -> Result<Vec<FileEntry>> {
    let file = File::create(tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    let mut entries = Vec::with_capacity(files.len());
    for (rel, path) in files {
        let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header
            .set_username("")
            .with_context(|| format!("set owner for {rel}"))?;
        header
            .set_groupname("")
            .with_context(|| format!("set group for {rel}"))?;
        builder
            .append_data(&mut header, rel, contents.as_slice())
            .with_context(|| format!("append {rel}"))?;

        let mut hasher = Sha256::new();
        hasher.update(&contents);
        entries.push(FileEntry {
            filename: rel.clone(),
            size: contents.len() as u64,
            sha256: hex::encode(hasher.finalize()),
        });
    }

    let encoder = builder.into_inner().context("finish tar stream")?;
    let writer = encoder.finish().context("finish gzip stream")?;
    let file = writer
        .into_inner()
        .map_err(|err| anyhow!("flush {}: {}", tmp_path.display(), err.error()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", tmp_path.display()))?;
    Ok(entries)
}

/// Number of entries in a `.tar.gz` archive.
pub fn count_entries(path: &Path) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut count = 0;
    for entry in archive
        .entries()
        .with_context(|| format!("read entries of {}", path.display()))?
    {
        entry.with_context(|| format!("read entry of {}", path.display()))?;
        count += 1;
    }
    Ok(count)
}

/// Extract a `.tar.gz` archive into `dest`.
///
/// Entries that would land outside `dest` are rejected.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive_path).with_context(|| format!("open {}", archive_path.display()))?;
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    for entry in archive
        .entries()
        .with_context(|| format!("read entries of {}", archive_path.display()))?
    {
        let mut entry =
            entry.with_context(|| format!("read entry of {}", archive_path.display()))?;
        let rel = entry.path().context("entry path")?.into_owned();
        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("unpack {}", rel.display()))?;
        if !unpacked {
            return Err(anyhow!(
                "archive {} entry {} escapes the destination",
                archive_path.display(),
                rel.display()
            ));
        }
    }
    Ok(())
}

/// Extract a package file into `dest`, picking the format from its name:
/// `.whl`/`.zip` are zip archives, `.tar.gz`/`.tgz` go through
/// [`unpack_archive`].
pub fn unpack_package_file(path: &Path, dest: &Path) -> Result<()> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".whl") || name.ends_with(".zip") {
        unpack_wheel(path, dest)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        unpack_archive(path, dest)
    } else {
        Err(anyhow!("unsupported package file format: {}", path.display()))
    }
}

/// Extract a wheel (zip) into `dest`. Entries with absolute or `..` paths are
/// rejected.
pub fn unpack_wheel(wheel_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(wheel_path).with_context(|| format!("open {}", wheel_path.display()))?;
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("read zip directory of {}", wheel_path.display()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("read entry {index} of {}", wheel_path.display()))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(anyhow!(
                "wheel {} entry {} escapes the destination",
                wheel_path.display(),
                entry.name()
            ));
        };
        let target = dest.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut out = File::create(&target).with_context(|| format!("create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out).with_context(|| format!("unpack {}", rel.display()))?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("archive path has no file name {}", path.display()))?;
    let mut tmp_name = name.to_os_string();
    tmp_name.push(".tmp");
    Ok(path.with_file_name(tmp_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write");
    }

    fn sample_tree(root: &Path) {
        write(&root.join("registry.json"), "{}");
        write(&root.join("agents/root/main.py"), "print('root')\n");
        write(&root.join("agents/multiplier/main.py"), "print('x')\n");
    }

    #[test]
    fn collects_sorted_relative_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        sample_tree(temp.path());
        let names: Vec<String> = collect_files(temp.path())
            .expect("collect")
            .into_iter()
            .map(|(rel, _)| rel)
            .collect();
        assert_eq!(
            names,
            vec![
                "agents/multiplier/main.py",
                "agents/root/main.py",
                "registry.json"
            ]
        );
    }

    #[test]
    fn identical_trees_produce_identical_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("a");
        let second = temp.path().join("b");
        sample_tree(&first);
        sample_tree(&second);

        let one = write_archive(&first, &temp.path().join("out/one.tar.gz")).expect("one");
        let two = write_archive(&second, &temp.path().join("out/two.tar.gz")).expect("two");
        assert_eq!(one.sha256, two.sha256);
        assert_eq!(
            fs::read(&one.path).expect("read one"),
            fs::read(&two.path).expect("read two")
        );
        assert_eq!(one.files.len(), 3);
        assert!(!temp.path().join("out/one.tar.gz.tmp").exists());
    }

    #[test]
    fn changing_one_byte_changes_the_hash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = temp.path().join("tree");
        sample_tree(&tree);
        let before = write_archive(&tree, &temp.path().join("a.tar.gz")).expect("before");
        write(&tree.join("agents/root/main.py"), "print('ROOT')\n");
        let after = write_archive(&tree, &temp.path().join("b.tar.gz")).expect("after");
        assert_ne!(before.sha256, after.sha256);
    }

    #[test]
    fn empty_tree_is_rejected_without_leaving_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = temp.path().join("empty");
        fs::create_dir_all(&tree).expect("mkdir");
        let out = temp.path().join("empty.tar.gz");
        let err = write_archive(&tree, &out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PackagingError>(),
            Some(PackagingError::EmptyArchive { .. })
        ));
        assert!(!out.exists());
        assert!(!temp.path().join("empty.tar.gz.tmp").exists());
    }

    #[test]
    fn unpack_restores_the_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = temp.path().join("tree");
        sample_tree(&tree);
        let summary = write_archive(&tree, &temp.path().join("code.tar.gz")).expect("archive");
        let dest = temp.path().join("unpacked");
        unpack_archive(&summary.path, &dest).expect("unpack");
        assert_eq!(describe_tree(&dest).expect("describe"), summary.files);
        assert_eq!(count_entries(&summary.path).expect("count"), 3);
    }

    fn wheel(path: &Path, entries: &[(&str, &str)]) {
        use std::io::Write;
        let file = File::create(path).expect("create wheel");
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .expect("start entry");
            writer.write_all(contents.as_bytes()).expect("write entry");
        }
        writer.finish().expect("finish wheel");
    }

    #[test]
    fn wheels_unpack_by_extension() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("six-1.16.0-py2.py3-none-any.whl");
        wheel(
            &path,
            &[
                ("six/__init__.py", "x = 1\n"),
                ("six-1.16.0.dist-info/METADATA", "Name: six\n"),
            ],
        );
        let dest = temp.path().join("lib");
        unpack_package_file(&path, &dest).expect("unpack");
        assert_eq!(
            fs::read_to_string(dest.join("six/__init__.py")).expect("read"),
            "x = 1\n"
        );
        assert!(dest.join("six-1.16.0.dist-info/METADATA").is_file());

        // A wheel is not a gzip stream.
        assert!(unpack_archive(&path, &temp.path().join("other")).is_err());
    }

    #[test]
    fn escaping_wheel_entries_and_unknown_formats_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("evil.whl");
        wheel(&path, &[("../outside.py", "boom")]);
        let err = unpack_package_file(&path, &temp.path().join("lib")).unwrap_err();
        assert!(err.to_string().contains("escapes"), "{err}");
        assert!(!temp.path().join("outside.py").exists());

        let odd = temp.path().join("pkg.rpm");
        fs::write(&odd, "x").expect("write");
        assert!(unpack_package_file(&odd, &temp.path().join("lib")).is_err());
    }
}
