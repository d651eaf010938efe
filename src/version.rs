//! Version algebra: parsing, comparison, and constraint satisfaction.
//!
//! Versions are dotted numeric triples compared as integer tuples. Pre-release
//! and build suffixes are out of scope and rejected at parse time.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

// ═══════════════════════════════════════════════════════════════════════════════
// Version
// ═══════════════════════════════════════════════════════════════════════════════

/// A `(major, minor, patch)` version. Missing components parse as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Three-way comparison returning -1, 0, or 1.
    pub fn compare(&self, other: &Version) -> i8 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::MalformedConstraint("empty version".into()));
        }
        // Pre-release / build metadata is not supported.
        if s.contains('-') || s.contains('+') {
            return Err(CoreError::MalformedConstraint(format!(
                "pre-release versions are not supported: '{}'",
                s
            )));
        }

        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() > 3 {
            return Err(CoreError::MalformedConstraint(format!(
                "too many version components: '{}'",
                s
            )));
        }

        let mut components = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            components[i] = part.parse::<u64>().map_err(|_| {
                CoreError::MalformedConstraint(format!("invalid version component '{}'", part))
            })?;
        }

        Ok(Self::new(components[0], components[1], components[2]))
    }
}

impl TryFrom<String> for Version {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Version Constraint
// ═══════════════════════════════════════════════════════════════════════════════

/// A constraint over versions. Total over well-formed versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    /// Satisfied by every version (`*`).
    Any,
    /// Exactly this version.
    Exact(Version),
    /// Greater than or equal.
    Gte(Version),
    /// Less than or equal.
    Lte(Version),
    /// Strictly greater.
    Gt(Version),
    /// Strictly less.
    Lt(Version),
    /// `>= v` and same major (`^`).
    Caret(Version),
    /// `>= v` and same major.minor (`~`).
    Tilde(Version),
}

impl VersionConstraint {
    /// Parse a constraint from its textual form.
    ///
    /// `*` maps to [`VersionConstraint::Any`]; a bare version maps to
    /// [`VersionConstraint::Exact`]. Fails with `MalformedConstraint` for any
    /// other shape.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::MalformedConstraint("empty constraint".into()));
        }

        if text == "*" {
            return Ok(Self::Any);
        }

        if let Some(rest) = text.strip_prefix(">=") {
            return Ok(Self::Gte(rest.parse()?));
        }
        if let Some(rest) = text.strip_prefix("<=") {
            return Ok(Self::Lte(rest.parse()?));
        }
        if let Some(rest) = text.strip_prefix('>') {
            return Ok(Self::Gt(rest.parse()?));
        }
        if let Some(rest) = text.strip_prefix('<') {
            return Ok(Self::Lt(rest.parse()?));
        }
        if let Some(rest) = text.strip_prefix('^') {
            return Ok(Self::Caret(rest.parse()?));
        }
        if let Some(rest) = text.strip_prefix('~') {
            return Ok(Self::Tilde(rest.parse()?));
        }

        Ok(Self::Exact(text.parse()?))
    }

    /// Check whether `version` satisfies this constraint.
    pub fn satisfies(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => version == v,
            Self::Gte(v) => version >= v,
            Self::Lte(v) => version <= v,
            Self::Gt(v) => version > v,
            Self::Lt(v) => version < v,
            Self::Caret(v) => version >= v && version.major == v.major,
            Self::Tilde(v) => {
                version >= v && version.major == v.major && version.minor == v.minor
            }
        }
    }

    /// Return the highest candidate satisfying this constraint, if any.
    pub fn best<'a, I>(&self, candidates: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates
            .into_iter()
            .filter(|v| self.satisfies(v))
            .max()
            .copied()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exact(v) => write!(f, "{}", v),
            Self::Gte(v) => write!(f, ">={}", v),
            Self::Lte(v) => write!(f, "<={}", v),
            Self::Gt(v) => write!(f, ">{}", v),
            Self::Lt(v) => write!(f, "<{}", v),
            Self::Caret(v) => write!(f, "^{}", v),
            Self::Tilde(v) => write!(f, "~{}", v),
        }
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<VersionConstraint> for String {
    fn from(c: VersionConstraint) -> Self {
        c.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_version_missing_components_are_zero() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.2"), Version::new(1, 2, 0));
        assert_eq!(v("1.2.3"), Version::new(1, 2, 3));
    }

    #[test]
    fn test_parse_rejects_prerelease() {
        assert!("1.0.0-alpha".parse::<Version>().is_err());
        assert!("1.0.0+build.5".parse::<Version>().is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let cases = [("1.0.0", "1.0.1"), ("1.2.3", "1.2.3"), ("2.0.0", "1.9.9")];
        for (a, b) in cases {
            let (a, b) = (v(a), v(b));
            assert_eq!(a.compare(&b), -b.compare(&a));
        }
        assert_eq!(v("1.2.3").compare(&v("1.2.3")), 0);
    }

    #[test]
    fn test_constraint_parse_shapes() {
        assert_eq!(VersionConstraint::parse("*").unwrap(), VersionConstraint::Any);
        assert_eq!(
            VersionConstraint::parse("1.2.3").unwrap(),
            VersionConstraint::Exact(v("1.2.3"))
        );
        assert_eq!(
            VersionConstraint::parse("^1.0.0").unwrap(),
            VersionConstraint::Caret(v("1.0.0"))
        );
        assert_eq!(
            VersionConstraint::parse("~1.0.0").unwrap(),
            VersionConstraint::Tilde(v("1.0.0"))
        );
        assert_eq!(
            VersionConstraint::parse(">=1.2").unwrap(),
            VersionConstraint::Gte(v("1.2.0"))
        );
        assert!(VersionConstraint::parse("").is_err());
        assert!(VersionConstraint::parse("^1.0.0-beta").is_err());
    }

    #[test]
    fn test_caret_semantics() {
        let c = VersionConstraint::Caret(v("1.2.0"));
        assert!(c.satisfies(&v("1.2.0")));
        assert!(c.satisfies(&v("1.9.9")));
        assert!(!c.satisfies(&v("2.0.0")));
        assert!(!c.satisfies(&v("1.1.9")));
    }

    #[test]
    fn test_tilde_semantics() {
        let c = VersionConstraint::Tilde(v("1.2.1"));
        assert!(c.satisfies(&v("1.2.1")));
        assert!(c.satisfies(&v("1.2.9")));
        assert!(!c.satisfies(&v("1.3.0")));
        assert!(!c.satisfies(&v("1.2.0")));
    }

    #[test]
    fn test_any_and_exact_are_reflexive() {
        for s in ["0.0.1", "1.0.0", "3.14.159"] {
            let version = v(s);
            assert!(VersionConstraint::Any.satisfies(&version));
            assert!(VersionConstraint::Exact(version).satisfies(&version));
        }
    }

    #[test]
    fn test_best_picks_highest_satisfying() {
        let candidates = vec![v("1.0.0"), v("1.1.0"), v("2.0.0")];
        let c = VersionConstraint::Caret(v("1.0.0"));
        assert_eq!(c.best(&candidates), Some(v("1.1.0")));

        let c = VersionConstraint::Lt(v("1.0.0"));
        assert_eq!(c.best(&candidates), None);

        let empty: Vec<Version> = vec![];
        assert_eq!(VersionConstraint::Any.best(&empty), None);
    }
}
