//! Module manifests and installed-module records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ModuleError, Result};
use crate::version::{parse_version, Version, VersionConstraint};

/// File name of the manifest every module package carries.
pub const MANIFEST_FILE: &str = "module.json";

/// Raw `module.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Required module -> minimum version or `"*"`.
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
    #[serde(default, rename = "post-install-commands")]
    pub post_install_commands: Vec<String>,
    #[serde(default, rename = "pre-uninstall-commands")]
    pub pre_uninstall_commands: Vec<String>,
}

/// A manifest whose version and constraints have been parsed.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub version: Version,
    pub description: Option<String>,
    pub requires: BTreeMap<String, VersionConstraint>,
    pub post_install_commands: Vec<String>,
    pub pre_uninstall_commands: Vec<String>,
}

impl Module {
    /// Parse manifest text, validating identifier, version and constraints.
    pub fn from_json(contents: &str) -> Result<Self> {
        let manifest: ModuleManifest = serde_json::from_str(contents)
            .map_err(|e| ModuleError::MalformedManifest(e.to_string()))?;
        Self::try_from(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ModuleError::MalformedManifest(format!("Failed to read {:?}: {}", path, e))
        })?;
        Self::from_json(&contents)
    }
}

impl TryFrom<ModuleManifest> for Module {
    type Error = ModuleError;

    fn try_from(manifest: ModuleManifest) -> Result<Self> {
        let name = manifest.name.trim().to_string();
        if name.is_empty() {
            return Err(ModuleError::MalformedManifest(
                "Module name cannot be empty".to_string(),
            ));
        }
        // The identifier becomes a directory name under the modules root.
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ModuleError::MalformedManifest(format!(
                "Module name '{}' is not a valid directory name",
                name
            )));
        }

        let version = parse_version(&manifest.version).map_err(|e| {
            ModuleError::MalformedManifest(format!(
                "Invalid version '{}' for module {}: {}",
                manifest.version, name, e
            ))
        })?;

        let mut requires = BTreeMap::new();
        for (dependency, constraint) in manifest.requires {
            let parsed = VersionConstraint::parse(&constraint).map_err(|e| {
                ModuleError::MalformedManifest(format!(
                    "Invalid version requirement '{}' for dependency {}: {}",
                    constraint, dependency, e
                ))
            })?;
            requires.insert(dependency, parsed);
        }

        Ok(Module {
            name,
            version,
            description: manifest.description,
            requires,
            post_install_commands: manifest.post_install_commands,
            pre_uninstall_commands: manifest.pre_uninstall_commands,
        })
    }
}

/// A module present under the modules root.
#[derive(Debug, Clone)]
pub struct InstalledModule {
    pub module: Module,
    pub root: PathBuf,
    pub enabled: bool,
}

impl InstalledModule {
    pub fn name(&self) -> &str {
        &self.module.name
    }

    pub fn version(&self) -> &Version {
        &self.module.version
    }

    /// True when this module declares a requirement on `target`.
    pub fn depends_on(&self, target: &str) -> bool {
        self.module.requires.contains_key(target)
    }
}

/// Kebab-cased identifier used for published asset directories
/// (`CourseBundle` becomes `course-bundle`).
pub fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;

    for c in name.chars() {
        if c.is_uppercase() {
            if prev_lower {
                out.push('-');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else if c == '_' || c == ' ' || c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_manifest() {
        let module = Module::from_json(
            r#"{
                "name": "Forum",
                "version": "1.4",
                "description": "Discussion boards",
                "requires": {"LMS": ">=2.0.0", "Blog": "*"},
                "post-install-commands": ["forum:install"],
                "pre-uninstall-commands": ["forum:cleanup"]
            }"#,
        )
        .unwrap();

        assert_eq!(module.name, "Forum");
        assert_eq!(module.version, Version::new(1, 4, 0));
        assert_eq!(module.requires["Blog"], VersionConstraint::Any);
        assert_eq!(
            module.requires["LMS"],
            VersionConstraint::AtLeast(Version::new(2, 0, 0))
        );
        assert_eq!(module.post_install_commands, vec!["forum:install"]);
        assert_eq!(module.pre_uninstall_commands, vec!["forum:cleanup"]);
    }

    #[test]
    fn optional_sections_default_to_empty() {
        let module = Module::from_json(r#"{"name": "Blog", "version": "1.0.0"}"#).unwrap();
        assert!(module.requires.is_empty());
        assert!(module.post_install_commands.is_empty());
        assert!(module.description.is_none());
    }

    #[test]
    fn rejects_bad_manifests() {
        for bad in [
            "not json",
            r#"{"version": "1.0.0"}"#,
            r#"{"name": "", "version": "1.0.0"}"#,
            r#"{"name": "../evil", "version": "1.0.0"}"#,
            r#"{"name": "Blog", "version": "latest"}"#,
            r#"{"name": "Blog", "version": "1.0.0", "requires": {"LMS": "newest"}}"#,
        ] {
            assert!(
                matches!(Module::from_json(bad), Err(ModuleError::MalformedManifest(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn kebab_case_splits_words() {
        assert_eq!(kebab_case("Blog"), "blog");
        assert_eq!(kebab_case("CourseBundle"), "course-bundle");
        assert_eq!(kebab_case("Zoom_Meeting"), "zoom-meeting");
        assert_eq!(kebab_case("Lms2Reports"), "lms2-reports");
    }
}
