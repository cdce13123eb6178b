use crate::error::{Result, WorkspaceError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` engine version.
///
/// A leading `v` and any pre-release or build suffix are accepted and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl EngineVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for EngineVersion {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WorkspaceError::InvalidVersion(s.to_string());

        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = trimmed
            .split(['-', '+'])
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(invalid)?;

        let mut parts = core.split('.');
        let mut next = || -> Result<u64> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| invalid()),
                None => Ok(0),
            }
        };
        let version = EngineVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for EngineVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EngineVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            "0.12.31".parse::<EngineVersion>().unwrap(),
            EngineVersion::new(0, 12, 31)
        );
        assert_eq!(
            "v1.5.0-beta1".parse::<EngineVersion>().unwrap(),
            EngineVersion::new(1, 5, 0)
        );
        assert_eq!(
            "1.2".parse::<EngineVersion>().unwrap(),
            EngineVersion::new(1, 2, 0)
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<EngineVersion>().is_err());
        assert!("one.two".parse::<EngineVersion>().is_err());
        assert!("1.2.3.4".parse::<EngineVersion>().is_err());
    }

    #[test]
    fn test_ordering_is_numeric() {
        let v = |s: &str| s.parse::<EngineVersion>().unwrap();
        assert!(v("0.12.31") < v("0.13.0"));
        assert!(v("0.9.0") < v("0.10.0"));
        assert!(v("1.0.0") > v("0.15.5"));
        assert_eq!(v("v0.13.0"), v("0.13.0"));
    }
}
