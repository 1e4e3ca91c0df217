//! `major[.minor[.patch]]` version numbers
//!
//! Used for the `schemaVersion` of test files and for the server versions in
//! run-on requirements.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{RunnerError, RunnerResult};

/// A parsed version; ordering is lexicographic over (major, minor, patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SchemaVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Parses a server version string, ignoring any pre-release or build
    /// suffix (`7.0.0-rc1` is `7.0.0`).
    pub fn parse_server_version(version: &str) -> RunnerResult<Self> {
        let numeric = version
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or_default();
        numeric.parse()
    }
}

impl FromStr for SchemaVersion {
    type Err = RunnerError;

    fn from_str(s: &str) -> RunnerResult<Self> {
        let invalid = || RunnerError::InvalidSchemaVersion(s.to_string());
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() > 3 {
            return Err(invalid());
        }

        let mut components = [0u64; 3];
        for (slot, part) in components.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(components[0], components[1], components[2]))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1", (1, 0, 0) ; "major only")]
    #[test_case("1.2", (1, 2, 0) ; "major and minor")]
    #[test_case("1.2.3", (1, 2, 3) ; "full")]
    #[test_case("0.0.0", (0, 0, 0) ; "zeros")]
    #[test_case("10.20.30", (10, 20, 30) ; "multi digit")]
    fn test_parse_defaults_missing_components(input: &str, expected: (u64, u64, u64)) {
        let version: SchemaVersion = input.parse().unwrap();
        assert_eq!((version.major, version.minor, version.patch), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("a" ; "letters")]
    #[test_case("1.2.3.4" ; "too many components")]
    #[test_case("1..2" ; "empty component")]
    #[test_case("1.2." ; "trailing dot")]
    #[test_case("-1" ; "negative")]
    #[test_case("1.x" ; "letter component")]
    fn test_parse_rejects(input: &str) {
        assert!(matches!(
            input.parse::<SchemaVersion>(),
            Err(RunnerError::InvalidSchemaVersion(_))
        ));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let v = |s: &str| s.parse::<SchemaVersion>().unwrap();
        assert!(v("1.2") < v("1.10"));
        assert!(v("1.9.9") < v("2"));
        assert_eq!(v("1.0"), v("1"));
        assert!(v("1.13") > v("1.2.99"));
    }

    #[test]
    fn test_server_version_suffix_ignored() {
        assert_eq!(
            SchemaVersion::parse_server_version("7.0.0-rc1").unwrap(),
            SchemaVersion::new(7, 0, 0)
        );
        assert_eq!(
            SchemaVersion::parse_server_version("4.4.1").unwrap(),
            SchemaVersion::new(4, 4, 1)
        );
    }

    #[test]
    fn test_serde_as_string() {
        let version: SchemaVersion = serde_json::from_str("\"1.5\"").unwrap();
        assert_eq!(version, SchemaVersion::new(1, 5, 0));
        assert_eq!(serde_json::to_string(&version).unwrap(), "\"1.5.0\"");
    }
}
