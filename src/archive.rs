//! Module package extraction.
//!
//! A package is a zip archive containing a `module.json` somewhere in its
//! tree, usually at the root or one directory down (`Blog/module.json`). The
//! directory holding the manifest is the module's content.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ModuleError, Result};
use crate::module::{Module, MANIFEST_FILE};

/// An extracted package sitting in the staging area.
///
/// The staging directory is removed when this value is dropped, so whoever
/// holds it decides how long the staged copy lives.
#[derive(Debug)]
pub struct StagedPackage {
    staging_dir: PathBuf,
    module_dir: PathBuf,
    pub module: Module,
}

impl StagedPackage {
    /// Root of the extracted archive.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Directory containing the manifest; this is what gets installed.
    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }
}

impl Drop for StagedPackage {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.staging_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?self.staging_dir, error = %e, "Failed to remove staging directory");
            }
        } else {
            debug!(path = ?self.staging_dir, "Staging directory removed");
        }
    }
}

/// Extract `archive_path` into a fresh directory under `staging_root`.
pub fn extract(archive_path: &Path, staging_root: &Path) -> Result<StagedPackage> {
    let file = File::open(archive_path).map_err(|e| {
        ModuleError::InvalidPackage(format!("Unable to open zip file {:?}: {}", archive_path, e))
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        ModuleError::InvalidPackage(format!("Unable to open zip file {:?}: {}", archive_path, e))
    })?;

    reject_symlinks(&mut archive, archive_path)?;

    let staging_dir = fresh_staging_dir(staging_root)?;
    debug!(archive = ?archive_path, staging = ?staging_dir, "Extracting module package");

    // From here on the directory exists; a guard removes it on every error path.
    let guard = StagingGuard(Some(staging_dir.clone()));

    archive.extract(&staging_dir).map_err(|e| {
        ModuleError::InvalidPackage(format!("Unable to extract {:?}: {}", archive_path, e))
    })?;

    let manifest_path = find_manifest(&staging_dir)
        .ok_or_else(|| ModuleError::InvalidPackage(format!("{} not found", MANIFEST_FILE)))?;
    let module = Module::from_file(&manifest_path)?;

    let module_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| staging_dir.clone());

    guard.disarm();
    Ok(StagedPackage {
        staging_dir,
        module_dir,
        module,
    })
}

/// Packages may not contain symbolic links: once extracted they would point
/// outside the staging tree and be followed when the module is copied.
fn reject_symlinks(archive: &mut zip::ZipArchive<File>, archive_path: &Path) -> Result<()> {
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(|e| {
            ModuleError::InvalidPackage(format!("Unable to read {:?}: {}", archive_path, e))
        })?;
        if entry.unix_mode().is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
            return Err(ModuleError::InvalidPackage(format!(
                "Package entry {} is a symbolic link",
                entry.name()
            )));
        }
    }
    Ok(())
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Breadth-first search for the manifest so the shallowest match wins.
/// Symbolic links are never followed.
pub fn find_manifest(root: &Path) -> Option<PathBuf> {
    let mut queue = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        let mut entries: Vec<(PathBuf, fs::FileType)> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| Some((e.path(), e.file_type().ok()?)))
                .collect(),
            Err(e) => {
                warn!(path = ?dir, error = %e, "Failed to read extracted directory");
                continue;
            }
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some((manifest, _)) = entries.iter().find(|(path, kind)| {
            kind.is_file() && path.file_name().is_some_and(|n| n == MANIFEST_FILE)
        }) {
            return Some(manifest.clone());
        }

        queue.extend(
            entries
                .into_iter()
                .filter(|(_, kind)| kind.is_dir())
                .map(|(path, _)| path),
        );
    }

    None
}

fn fresh_staging_dir(staging_root: &Path) -> Result<PathBuf> {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let dir = staging_root.join(format!("{}_{}", timestamp, uuid::Uuid::new_v4().simple()));
    fs::create_dir_all(&dir).map_err(|e| {
        ModuleError::failed(format!("Failed to create staging directory {:?}", dir), e)
    })?;
    Ok(dir)
}

struct StagingGuard(Option<PathBuf>);

impl StagingGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.0.take() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn extracts_nested_module() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("blog.zip");
        write_zip(
            &archive,
            &[
                ("Blog/module.json", r#"{"name": "Blog", "version": "1.0.0"}"#),
                ("Blog/routes/web.php", "<?php"),
                ("README.md", "readme"),
            ],
        );

        let staging_root = dir.path().join("staging");
        let staged = extract(&archive, &staging_root).unwrap();
        assert_eq!(staged.module.name, "Blog");
        assert!(staged.module_dir().ends_with("Blog"));
        assert!(staged.module_dir().join("routes/web.php").is_file());

        let staging_dir = staged.staging_dir().to_path_buf();
        drop(staged);
        assert!(!staging_dir.exists());
    }

    #[test]
    fn unreadable_archive_is_invalid_package() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        let result = extract(&archive, &dir.path().join("staging"));
        assert!(matches!(result, Err(ModuleError::InvalidPackage(_))));

        let missing = extract(&dir.path().join("missing.zip"), &dir.path().join("staging"));
        assert!(matches!(missing, Err(ModuleError::InvalidPackage(_))));
    }

    #[test]
    fn archive_without_manifest_leaves_no_staging() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.zip");
        write_zip(&archive, &[("src/lib.php", "<?php")]);

        let staging_root = dir.path().join("staging");
        let result = extract(&archive, &staging_root);
        assert!(matches!(result, Err(ModuleError::InvalidPackage(_))));
        assert_eq!(fs::read_dir(&staging_root).unwrap().count(), 0);
    }

    #[test]
    fn malformed_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        write_zip(&archive, &[("module.json", r#"{"name": "Bad"}"#)]);

        let staging_root = dir.path().join("staging");
        let result = extract(&archive, &staging_root);
        assert!(matches!(result, Err(ModuleError::MalformedManifest(_))));
        assert_eq!(fs::read_dir(&staging_root).unwrap().count(), 0);
    }

    #[test]
    fn shallowest_manifest_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/vendor/dep")).unwrap();
        fs::write(dir.path().join("a/vendor/dep/module.json"), "{}").unwrap();
        fs::write(dir.path().join("a/module.json"), "{}").unwrap();

        let found = find_manifest(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("a/module.json"));
    }

    #[test]
    fn symlink_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "host data").unwrap();

        let archive = dir.path().join("evil.zip");
        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("Evil/module.json", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(br#"{"name": "Evil", "version": "1.0.0"}"#).unwrap();
        zip.add_symlink(
            "Evil/leak",
            outside.to_string_lossy(),
            SimpleFileOptions::default(),
        )
        .unwrap();
        zip.finish().unwrap();

        let staging_root = dir.path().join("staging");
        let result = extract(&archive, &staging_root);
        assert!(matches!(result, Err(ModuleError::InvalidPackage(ref m)) if m.contains("Evil/leak")));
        assert_eq!(fs::read_dir(&staging_root).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[cfg(unix)]
    #[test]
    fn manifest_search_does_not_follow_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = dir.path().join("elsewhere");
        fs::create_dir_all(&elsewhere).unwrap();
        fs::write(elsewhere.join("module.json"), "{}").unwrap();

        let root = dir.path().join("staged");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(&elsewhere, root.join("link")).unwrap();
        std::os::unix::fs::symlink(&root, root.join("loop")).unwrap();

        assert_eq!(find_manifest(&root), None);
    }
}
