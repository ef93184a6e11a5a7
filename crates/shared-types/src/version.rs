//! # Version Metadata
//!
//! Build information baked into the binary. A zero `VersionInfo` means the
//! binary was built without release metadata (development builds).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::VersionError;

/// Semantic version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for SemVer {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidSemVer(s.to_string());
        let trimmed = s.strip_prefix('v').unwrap_or(s);
        let mut parts = trimmed.splitn(3, '.');

        let mut next = || -> Result<u64, VersionError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u64>()
                .map_err(|_| invalid())
        };

        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        Ok(Self { major, minor, patch })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Build information for the running binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub timestamp: Option<DateTime<Utc>>,
    pub commit_hash: String,
    pub version: String,
    pub release: bool,
}

impl VersionInfo {
    /// True when no build metadata was provided.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.timestamp.is_none() && self.commit_hash.is_empty() && self.version.is_empty() && !self.release
    }

    /// Parsed semantic version, `None` for zero info.
    pub fn semver(&self) -> Result<Option<SemVer>, VersionError> {
        if self.version.is_empty() {
            return Ok(None);
        }
        self.version.parse().map(Some)
    }

    /// Convert to the descriptor advertised to other nodes.
    ///
    /// Zero info converts to a default descriptor; anything else must carry a
    /// valid version and a build timestamp.
    pub fn to_node_version(&self) -> Result<NodeVersion, VersionError> {
        if self.is_zero() {
            return Ok(NodeVersion::default());
        }

        let version = self
            .semver()?
            .ok_or_else(|| VersionError::InvalidSemVer(self.version.clone()))?;
        let timestamp = self
            .timestamp
            .ok_or_else(|| VersionError::MissingTimestamp(self.version.clone()))?;

        Ok(NodeVersion {
            version,
            commit_hash: self.commit_hash.clone(),
            timestamp: Some(timestamp),
            release: self.release,
        })
    }
}

/// Version descriptor included in a node dossier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub version: SemVer,
    pub commit_hash: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub release: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semver_parse() {
        assert_eq!("v1.2.3".parse::<SemVer>().unwrap(), SemVer::new(1, 2, 3));
        assert_eq!("0.28.4".parse::<SemVer>().unwrap(), SemVer::new(0, 28, 4));
        assert!("1.2".parse::<SemVer>().is_err());
        assert!("one.two.three".parse::<SemVer>().is_err());
    }

    #[test]
    fn test_semver_ordering() {
        assert!(SemVer::new(1, 10, 0) > SemVer::new(1, 9, 9));
        assert!(SemVer::new(0, 1, 0) < SemVer::new(1, 0, 0));
    }

    #[test]
    fn test_zero_info_converts_to_default() {
        let info = VersionInfo::default();
        assert!(info.is_zero());
        assert_eq!(info.to_node_version().unwrap(), NodeVersion::default());
    }

    #[test]
    fn test_invalid_version_fails_conversion() {
        let info = VersionInfo {
            version: "not-a-version".into(),
            timestamp: Some(Utc::now()),
            ..VersionInfo::default()
        };
        assert!(matches!(
            info.to_node_version(),
            Err(VersionError::InvalidSemVer(_))
        ));
    }

    #[test]
    fn test_missing_timestamp_fails_conversion() {
        let info = VersionInfo {
            version: "v1.0.0".into(),
            ..VersionInfo::default()
        };
        assert!(matches!(
            info.to_node_version(),
            Err(VersionError::MissingTimestamp(_))
        ));
    }
}
