//! Graph schema versions.
//!
//! Versions are semver-shaped numeric triples compared lexicographically.
//! The revision engine only ever generates patch bumps; major and minor are
//! parsed and compared but reserved.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `MAJOR.MINOR.PATCH` graph version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GraphVersion {
    /// Major component (reserved)
    pub major: u32,
    /// Minor component (reserved)
    pub minor: u32,
    /// Patch component, bumped by each applied revision
    pub patch: u32,
}

impl GraphVersion {
    /// The version every new graph starts at
    pub const INITIAL: GraphVersion = GraphVersion { major: 1, minor: 0, patch: 0 };

    /// Create a version from components
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// The next version a revision will target
    pub fn next_patch(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor,
            patch: self.patch + 1,
        }
    }
}

impl fmt::Display for GraphVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for GraphVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = |_label: &str| -> Result<u32, EngineError> {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(|| EngineError::InvalidVersion(s.to_string()))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(EngineError::InvalidVersion(s.to_string()));
        }
        Ok(Self { major, minor, patch })
    }
}

impl TryFrom<String> for GraphVersion {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GraphVersion> for String {
    fn from(v: GraphVersion) -> String {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let v: GraphVersion = "1.2.3".parse().unwrap();
        assert_eq!(v, GraphVersion::new(1, 2, 3));
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!("1.2".parse::<GraphVersion>().is_err());
        assert!("1.2.3.4".parse::<GraphVersion>().is_err());
        assert!("a.b.c".parse::<GraphVersion>().is_err());
        assert!("".parse::<GraphVersion>().is_err());
    }

    #[test]
    fn ordering_is_lexicographic_on_triples() {
        let base = GraphVersion::new(1, 0, 9);
        assert!(base < GraphVersion::new(1, 1, 0));
        assert!(base < GraphVersion::new(2, 0, 0));
        assert!(GraphVersion::new(1, 0, 2) < GraphVersion::new(1, 0, 10));
    }

    #[test]
    fn next_patch_only_bumps_patch() {
        let v = GraphVersion::INITIAL.next_patch();
        assert_eq!(v.to_string(), "1.0.1");
        assert_eq!(v.next_patch().to_string(), "1.0.2");
    }

    #[test]
    fn serde_uses_string_form() {
        let v = GraphVersion::new(1, 0, 1);
        assert_eq!(serde_json::to_value(v).unwrap(), serde_json::json!("1.0.1"));
        let back: GraphVersion = serde_json::from_value(serde_json::json!("1.0.1")).unwrap();
        assert_eq!(back, v);
    }
}
