//! Shared value types for the findex storage core.
//!
//! This crate provides the small set of types that more than one findex
//! crate needs to agree on, most importantly [`SchemaVersion`], the ordered
//! identifier recorded in the database for every applied migration.
//!
//! It depends on nothing but `serde` and `thiserror`, so code that only needs
//! to name a schema version can use it without pulling in SQLite.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A schema version as a semantic triplet (`MAJOR.MINOR.PATCH`).
///
/// Versions order lexicographically by component, so `1.10.0` sorts after
/// `1.9.0`. The textual form is what gets stored in the metadata table and
/// in the migration history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchemaVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl SchemaVersion {
    /// The version of a database that has never been migrated.
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    /// Creates a version from its three components.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Returns `true` for `0.0.0`.
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned when a string is not a `MAJOR.MINOR.PATCH` triplet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid schema version '{input}': {reason}")]
pub struct ParseSchemaVersionError {
    /// The rejected input.
    pub input: String,
    /// Why the input was rejected.
    pub reason: &'static str,
}

impl FromStr for SchemaVersion {
    type Err = ParseSchemaVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reject = |reason| ParseSchemaVersionError {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut parts = trimmed.split('.');
        let mut next = || -> Result<u32, ParseSchemaVersionError> {
            let part = parts.next().ok_or_else(|| reject("expected three components"))?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(reject("components must be unsigned integers"));
            }
            part.parse().map_err(|_| reject("component out of range"))
        };

        let version = SchemaVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(reject("expected three components"));
        }
        Ok(version)
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

    #[test]
    fn parses_semantic_triplets() {
        assert_eq!("1.2.3".parse(), Ok(SchemaVersion::new(1, 2, 3)));
        assert_eq!("v0.10.0".parse(), Ok(SchemaVersion::new(0, 10, 0)));
        assert_eq!(" 2.0.0 ".parse(), Ok(SchemaVersion::new(2, 0, 0)));
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "1", "1.2", "1.2.3.4", "1.x.0", "-1.0.0", "1..0"] {
            assert!(
                input.parse::<SchemaVersion>().is_err(),
                "'{input}' should not parse"
            );
        }
    }

    #[test]
    fn orders_numerically_not_lexically() {
        let v9 = SchemaVersion::new(1, 9, 0);
        let v10 = SchemaVersion::new(1, 10, 0);
        assert!(v10 > v9);
        assert!(SchemaVersion::ZERO < SchemaVersion::new(0, 0, 1));
    }

    #[test]
    fn display_matches_stored_form() {
        assert_eq!(SchemaVersion::new(1, 2, 0).to_string(), "1.2.0");
        assert!(SchemaVersion::default().is_zero());
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&SchemaVersion::new(1, 1, 0)).expect("should serialize");
        assert_eq!(json, "\"1.1.0\"");

        let back: SchemaVersion = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, SchemaVersion::new(1, 1, 0));

        assert!(serde_json::from_str::<SchemaVersion>("\"nope\"").is_err());
    }
}
