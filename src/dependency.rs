//! Dependency checks against the set of installed modules.
//!
//! Both directions report every problem at once rather than stopping at the
//! first, so an administrator can fix everything in one round trip.

use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ModuleError, Result};
use crate::module::InstalledModule;
use crate::version::VersionConstraint;

/// Check that every declared requirement is met by an installed module.
///
/// Fails with [`ModuleError::MissingDependencies`] listing each absent module
/// and each module whose installed version is too old.
pub fn check_dependencies(
    declared: &BTreeMap<String, VersionConstraint>,
    installed: &[InstalledModule],
) -> Result<()> {
    let mut missing = Vec::new();

    for (name, constraint) in declared {
        let Some(found) = installed.iter().find(|m| m.name() == name) else {
            missing.push(format!("{} (version {})", name, constraint));
            continue;
        };

        if !constraint.is_satisfied_by(found.version()) {
            missing.push(format!(
                "{} (requires {}, installed {})",
                name,
                constraint,
                found.version()
            ));
        }
    }

    if missing.is_empty() {
        debug!(count = declared.len(), "Dependencies satisfied");
        Ok(())
    } else {
        Err(ModuleError::MissingDependencies(missing))
    }
}

/// Check that no other installed module requires `target`.
///
/// Fails with [`ModuleError::Blocked`] listing every dependent.
pub fn check_dependents(target: &str, installed: &[InstalledModule]) -> Result<()> {
    let dependents: Vec<String> = installed
        .iter()
        .filter(|m| m.name() != target && m.depends_on(target))
        .map(|m| m.name().to_string())
        .collect();

    if dependents.is_empty() {
        Ok(())
    } else {
        Err(ModuleError::Blocked {
            module: target.to_string(),
            dependents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use std::path::PathBuf;

    fn installed(name: &str, version: &str, requires: &[(&str, &str)]) -> InstalledModule {
        let requires: serde_json::Map<String, serde_json::Value> = requires
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect();
        let manifest = serde_json::json!({
            "name": name,
            "version": version,
            "requires": requires,
        });
        InstalledModule {
            module: Module::from_json(&manifest.to_string()).unwrap(),
            root: PathBuf::from("Modules").join(name),
            enabled: true,
        }
    }

    fn declared(pairs: &[(&str, &str)]) -> BTreeMap<String, VersionConstraint> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), VersionConstraint::parse(v).unwrap()))
            .collect()
    }

    #[test]
    fn minimum_version_boundaries() {
        let req = declared(&[("LMS", ">=1.2.0")]);

        let err = check_dependencies(&req, &[installed("LMS", "1.1.9", &[])]).unwrap_err();
        match err {
            ModuleError::MissingDependencies(list) => {
                assert_eq!(list, vec!["LMS (requires 1.2.0, installed 1.1.9)"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(check_dependencies(&req, &[installed("LMS", "1.2.0", &[])]).is_ok());
        assert!(check_dependencies(&req, &[installed("LMS", "1.3.0", &[])]).is_ok());
    }

    #[test]
    fn wildcard_needs_presence_only() {
        let req = declared(&[("Blog", "*")]);
        assert!(check_dependencies(&req, &[installed("Blog", "0.0.1", &[])]).is_ok());

        let err = check_dependencies(&req, &[]).unwrap_err();
        assert!(matches!(err, ModuleError::MissingDependencies(ref l) if l == &vec!["Blog (version *)".to_string()]));
    }

    #[test]
    fn reports_every_unmet_dependency() {
        let req = declared(&[("Blog", "*"), ("Forum", "2.0"), ("LMS", "1.0")]);
        let err = check_dependencies(&req, &[installed("Forum", "1.5.0", &[])]).unwrap_err();
        match err {
            ModuleError::MissingDependencies(list) => {
                assert_eq!(list.len(), 3);
                assert!(list[0].starts_with("Blog"));
                assert!(list[1].contains("requires 2.0.0, installed 1.5.0"));
                assert!(list[2].starts_with("LMS"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dependents_block_removal() {
        let modules = vec![
            installed("LMS", "1.0.0", &[]),
            installed("Blog", "1.0.0", &[("LMS", "*")]),
            installed("Forum", "1.0.0", &[("LMS", "1.0"), ("Blog", "*")]),
        ];

        match check_dependents("LMS", &modules).unwrap_err() {
            ModuleError::Blocked { module, dependents } => {
                assert_eq!(module, "LMS");
                assert_eq!(dependents, vec!["Blog", "Forum"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(check_dependents("Forum", &modules).is_ok());
    }
}
