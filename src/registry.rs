//! Module registry and on-disk module discovery.
//!
//! The registry is a single JSON object mapping module identifier to its
//! enabled flag (`modules_statuses.json`). It is rewritten wholesale on every
//! change. Discovery walks the modules root, where each module lives in
//! `<modules_dir>/<identifier>/` next to its `module.json`.
//!
//! The registry is read at the start of an operation and saved at the end.
//! Callers hold a [`RegistryLock`](crate::lock::RegistryLock) around the
//! read-modify-write so concurrent administrators do not lose each other's
//! writes.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::module::{InstalledModule, Module, MANIFEST_FILE};
use crate::operations::write_atomic;

/// Identifier -> enabled flag.
pub type Statuses = BTreeMap<String, bool>;

/// File-backed module status registry.
#[derive(Debug, Clone)]
pub struct StatusRegistry {
    path: PathBuf,
}

impl StatusRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty registry file if none exists yet.
    pub fn initialize(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.save(&Statuses::new())
    }

    /// Read the current statuses. A missing file reads as empty.
    pub fn load(&self) -> Result<Statuses> {
        if !self.path.exists() {
            return Ok(Statuses::new());
        }

        let contents = fs::read_to_string(&self.path)
            .context(format!("Failed to read registry: {:?}", self.path))?;
        if contents.trim().is_empty() {
            return Ok(Statuses::new());
        }

        serde_json::from_str(&contents)
            .context(format!("Failed to parse registry: {:?}", self.path))
    }

    /// Replace the registry contents.
    pub fn save(&self, statuses: &Statuses) -> Result<()> {
        let content = serde_json::to_string_pretty(statuses)?;
        write_atomic(&self.path, content.as_bytes())
            .context(format!("Failed to save registry: {:?}", self.path))?;

        debug!(path = ?self.path, entries = statuses.len(), "Registry saved");
        Ok(())
    }
}

/// Root directory of the module called `name`.
pub fn module_root(modules_dir: &Path, name: &str) -> PathBuf {
    modules_dir.join(name)
}

/// Read the module installed at `<modules_dir>/<name>`, if there is one.
pub fn find_installed(
    modules_dir: &Path,
    name: &str,
    statuses: &Statuses,
) -> crate::error::Result<Option<InstalledModule>> {
    let root = module_root(modules_dir, name);
    let manifest = root.join(MANIFEST_FILE);
    if !manifest.is_file() {
        return Ok(None);
    }

    let module = Module::from_file(&manifest)?;
    Ok(Some(InstalledModule {
        enabled: statuses.get(&module.name).copied().unwrap_or(false),
        module,
        root,
    }))
}

/// Scan the modules root and return every module found there, sorted by name.
///
/// Directories without a readable manifest are skipped with a warning.
pub fn scan_installed(modules_dir: &Path, statuses: &Statuses) -> Result<Vec<InstalledModule>> {
    let mut installed = Vec::new();

    if !modules_dir.exists() {
        return Ok(installed);
    }

    let entries = fs::read_dir(modules_dir)
        .context(format!("Failed to read modules directory: {:?}", modules_dir))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let manifest = path.join(MANIFEST_FILE);
        if !manifest.is_file() {
            continue;
        }

        match Module::from_file(&manifest) {
            Ok(module) => {
                let dir_name = entry.file_name().to_string_lossy().to_string();
                if dir_name != module.name {
                    warn!(
                        directory = %dir_name,
                        module = %module.name,
                        "Module directory does not match manifest name; skipping"
                    );
                    continue;
                }
                installed.push(InstalledModule {
                    enabled: statuses.get(&module.name).copied().unwrap_or(false),
                    module,
                    root: path,
                });
            }
            Err(e) => {
                warn!(path = ?manifest, error = %e, "Skipping module with unreadable manifest");
            }
        }
    }

    installed.sort_by(|a, b| a.module.name.cmp(&b.module.name));
    Ok(installed)
}

/// Differences applied by [`reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncChanges {
    /// On-disk modules that had no registry entry (registered as disabled).
    pub added: Vec<String>,
    /// Registry entries whose module directory is gone.
    pub removed: Vec<String>,
}

impl SyncChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Bring `statuses` in line with what is on disk.
pub fn reconcile(statuses: &mut Statuses, installed: &[InstalledModule]) -> SyncChanges {
    let mut changes = SyncChanges::default();

    for module in installed {
        if !statuses.contains_key(module.name()) {
            statuses.insert(module.name().to_string(), false);
            changes.added.push(module.name().to_string());
        }
    }

    let stale: Vec<String> = statuses
        .keys()
        .filter(|name| !installed.iter().any(|m| m.name() == name.as_str()))
        .cloned()
        .collect();
    for name in stale {
        statuses.remove(&name);
        changes.removed.push(name);
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_module(modules_dir: &Path, dir: &str, manifest: &str) {
        let root = modules_dir.join(dir);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[test]
    fn missing_registry_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::new(dir.path().join("modules_statuses.json"));
        assert!(registry.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_preserves_flags() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StatusRegistry::new(dir.path().join("nested/modules_statuses.json"));

        let mut statuses = Statuses::new();
        statuses.insert("Blog".to_string(), true);
        statuses.insert("Forum".to_string(), false);
        registry.save(&statuses).unwrap();

        assert_eq!(registry.load().unwrap(), statuses);
        let raw = fs::read_to_string(registry.path()).unwrap();
        assert!(raw.contains("\"Blog\": true"));
    }

    #[test]
    fn corrupt_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules_statuses.json");
        fs::write(&path, "{not json").unwrap();
        assert!(StatusRegistry::new(path).load().is_err());
    }

    #[test]
    fn scan_reads_manifests_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "Blog", r#"{"name": "Blog", "version": "1.0.0"}"#);
        write_module(dir.path(), "Forum", r#"{"name": "Forum", "version": "2.1"}"#);
        write_module(dir.path(), "Broken", "{");
        write_module(dir.path(), "Renamed", r#"{"name": "Other", "version": "1.0.0"}"#);
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let mut statuses = Statuses::new();
        statuses.insert("Forum".to_string(), true);

        let installed = scan_installed(dir.path(), &statuses).unwrap();
        let names: Vec<&str> = installed.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["Blog", "Forum"]);
        assert!(!installed[0].enabled);
        assert!(installed[1].enabled);
    }

    #[test]
    fn reconcile_adds_and_drops_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "Blog", r#"{"name": "Blog", "version": "1.0.0"}"#);

        let mut statuses = Statuses::new();
        statuses.insert("Ghost".to_string(), true);

        let installed = scan_installed(dir.path(), &statuses).unwrap();
        let changes = reconcile(&mut statuses, &installed);

        assert_eq!(changes.added, vec!["Blog"]);
        assert_eq!(changes.removed, vec!["Ghost"]);
        assert_eq!(statuses.get("Blog"), Some(&false));
        assert!(!statuses.contains_key("Ghost"));
    }
}
