//! Version ordering and dependency constraints.
//!
//! Module versions are compared with `semver` ordering. Manifests in the wild
//! often carry short versions such as `"1.2"` or a leading `v`, so parsing is
//! lenient: missing components are treated as zero.

use std::fmt;

pub type Version = semver::Version;

/// Minimum version a dependency must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// `"*"`: any installed version will do.
    Any,
    /// Installed version must be greater than or equal to this one.
    AtLeast(Version),
}

impl VersionConstraint {
    /// Parse a constraint such as `"*"`, `"1.2"`, `"1.2.0"` or `">=1.2.0"`.
    pub fn parse(s: &str) -> Result<Self, semver::Error> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(VersionConstraint::Any);
        }
        let s = s
            .strip_prefix(">=")
            .or_else(|| s.strip_prefix('='))
            .unwrap_or(s)
            .trim();
        parse_version(s).map(VersionConstraint::AtLeast)
    }

    pub fn is_satisfied_by(&self, installed: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::AtLeast(required) => installed >= required,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => f.write_str("*"),
            VersionConstraint::AtLeast(v) => write!(f, "{v}"),
        }
    }
}

/// Parse a version, padding `"1"` / `"1.2"` out to three components.
pub fn parse_version(s: &str) -> Result<Version, semver::Error> {
    let s = s.trim();
    let s = s.strip_prefix('v').or_else(|| s.strip_prefix('V')).unwrap_or(s);

    // Split off pre-release/build metadata so only the numeric core is padded.
    let split = s.find(['-', '+']).unwrap_or(s.len());
    let (core, rest) = s.split_at(split);
    let components = core.split('.').count();
    let padded = match components {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => s.to_string(),
    };
    Version::parse(&padded)
}

/// True when `candidate` is strictly newer than `current`.
pub fn is_newer(candidate: &Version, current: &Version) -> bool {
    candidate > current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_parsing_pads_missing_components() {
        assert_eq!(parse_version("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(parse_version("v2.0.1").unwrap(), Version::new(2, 0, 1));
        assert_eq!(
            parse_version("1.2-beta.1").unwrap(),
            Version::parse("1.2.0-beta.1").unwrap()
        );
        assert!(parse_version("one.two").is_err());
    }

    #[test]
    fn minimum_version_comparison() {
        let req = VersionConstraint::parse(">=1.2.0").unwrap();
        assert!(!req.is_satisfied_by(&parse_version("1.1.9").unwrap()));
        assert!(req.is_satisfied_by(&parse_version("1.2.0").unwrap()));
        assert!(req.is_satisfied_by(&parse_version("1.3.0").unwrap()));

        let bare = VersionConstraint::parse("1.2").unwrap();
        assert_eq!(bare, req);
    }

    #[test]
    fn wildcard_accepts_anything() {
        let any = VersionConstraint::parse("*").unwrap();
        assert_eq!(any, VersionConstraint::Any);
        assert!(any.is_satisfied_by(&parse_version("0.0.1").unwrap()));
        assert_eq!(VersionConstraint::parse("").unwrap(), VersionConstraint::Any);
        assert_eq!(any.to_string(), "*");
    }

    #[test]
    fn newer_is_strict() {
        let one = parse_version("1.0").unwrap();
        let two = parse_version("2.0").unwrap();
        assert!(is_newer(&two, &one));
        assert!(!is_newer(&one, &one));
        assert!(!is_newer(&one, &two));
    }
}
