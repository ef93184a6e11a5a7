//! TLS options built from the server configuration.
//!
//! Construction fails when the options cannot be honored: an unknown identity
//! version, a whitelist that is required but unreadable, or a local identity
//! that the revocation source reports as revoked.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use shared_types::{FullIdentity, NodeId, RevocationDb, StorageError};
use thiserror::Error;

use crate::container::config::ServerConfig;

/// Identity versions this build can verify.
pub const SUPPORTED_ID_VERSIONS: [u8; 2] = [0, 1];

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid peer id versions {0:?}")]
    InvalidIdVersions(String),

    #[error("peer CA whitelist enabled but no path configured")]
    MissingWhitelist,

    #[error("peer CA whitelist {path}: {reason}")]
    Whitelist { path: PathBuf, reason: String },

    #[error("identity {0} is revoked")]
    Revoked(NodeId),

    #[error("peer {0} is not whitelisted")]
    NotWhitelisted(NodeId),

    #[error("revocation check failed: {0}")]
    Revocation(#[from] StorageError),
}

/// Validated TLS options for the local identity.
pub struct Options {
    node_id: NodeId,
    id_versions: Vec<u8>,
    whitelist: Option<HashSet<NodeId>>,
    revocation: Option<Arc<dyn RevocationDb>>,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("node_id", &self.node_id)
            .field("id_versions", &self.id_versions)
            .field("whitelisted", &self.whitelist.as_ref().map(HashSet::len))
            .field("revocation", &self.revocation.is_some())
            .finish()
    }
}

impl Options {
    pub fn new(
        identity: &FullIdentity,
        config: &ServerConfig,
        revocation_db: Arc<dyn RevocationDb>,
    ) -> Result<Self, TlsError> {
        let id_versions = parse_id_versions(&config.peer_id_versions)?;

        let whitelist = if config.use_peer_ca_whitelist {
            let path = config
                .peer_ca_whitelist_path
                .as_ref()
                .ok_or(TlsError::MissingWhitelist)?;
            Some(load_whitelist(path)?)
        } else {
            None
        };

        let revocation = config.revocation_check.then_some(revocation_db);
        if let Some(db) = &revocation {
            if db.is_revoked(&identity.id)? {
                return Err(TlsError::Revoked(identity.id));
            }
        }

        Ok(Self {
            node_id: identity.id,
            id_versions,
            whitelist,
            revocation,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn id_versions(&self) -> &[u8] {
        &self.id_versions
    }

    /// Apply the whitelist and revocation checks to a remote peer.
    pub fn verify_peer(&self, peer: &NodeId) -> Result<(), TlsError> {
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.contains(peer) {
                return Err(TlsError::NotWhitelisted(*peer));
            }
        }
        if let Some(db) = &self.revocation {
            if db.is_revoked(peer)? {
                return Err(TlsError::Revoked(*peer));
            }
        }
        Ok(())
    }
}

fn parse_id_versions(raw: &str) -> Result<Vec<u8>, TlsError> {
    let invalid = || TlsError::InvalidIdVersions(raw.to_string());
    let trimmed = raw.trim();

    if trimmed.eq_ignore_ascii_case("latest") {
        return SUPPORTED_ID_VERSIONS.last().map(|v| vec![*v]).ok_or_else(invalid);
    }

    let mut versions = Vec::new();
    for part in trimmed.split(',') {
        let version: u8 = part.trim().parse().map_err(|_| invalid())?;
        if !SUPPORTED_ID_VERSIONS.contains(&version) {
            return Err(invalid());
        }
        if !versions.contains(&version) {
            versions.push(version);
        }
    }
    Ok(versions)
}

fn load_whitelist(path: &PathBuf) -> Result<HashSet<NodeId>, TlsError> {
    let raw = std::fs::read_to_string(path).map_err(|e| TlsError::Whitelist {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            NodeId::from_hex(line).map_err(|e| TlsError::Whitelist {
                path: path.clone(),
                reason: format!("{line}: {e}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Revoked(Vec<NodeId>);

    impl RevocationDb for Revoked {
        fn is_revoked(&self, node_id: &NodeId) -> Result<bool, StorageError> {
            Ok(self.0.contains(node_id))
        }
    }

    fn none_revoked() -> Arc<dyn RevocationDb> {
        Arc::new(Revoked(vec![]))
    }

    #[test]
    fn test_latest_selects_highest_version() {
        assert_eq!(parse_id_versions("latest").unwrap(), vec![1]);
        assert_eq!(parse_id_versions("0, 1,1").unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_unknown_id_version_is_rejected() {
        assert!(matches!(parse_id_versions("7"), Err(TlsError::InvalidIdVersions(_))));
        assert!(matches!(parse_id_versions("one"), Err(TlsError::InvalidIdVersions(_))));
    }

    #[test]
    fn test_whitelist_required_without_path() {
        let identity = FullIdentity::from_seed([1; 32]);
        let config = ServerConfig {
            use_peer_ca_whitelist: true,
            ..ServerConfig::default()
        };
        let result = Options::new(&identity, &config, none_revoked());
        assert!(matches!(result, Err(TlsError::MissingWhitelist)));
    }

    #[test]
    fn test_whitelist_filters_peers() {
        let identity = FullIdentity::from_seed([1; 32]);
        let allowed = FullIdentity::from_seed([2; 32]).id;
        let other = FullIdentity::from_seed([3; 32]).id;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# trusted\n{allowed}").unwrap();

        let config = ServerConfig {
            use_peer_ca_whitelist: true,
            peer_ca_whitelist_path: Some(file.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let options = Options::new(&identity, &config, none_revoked()).unwrap();

        assert!(options.verify_peer(&allowed).is_ok());
        assert!(matches!(options.verify_peer(&other), Err(TlsError::NotWhitelisted(_))));
    }

    #[test]
    fn test_revoked_identity_fails_construction() {
        let identity = FullIdentity::from_seed([4; 32]);
        let db: Arc<dyn RevocationDb> = Arc::new(Revoked(vec![identity.id]));
        let result = Options::new(&identity, &ServerConfig::default(), db);
        assert!(matches!(result, Err(TlsError::Revoked(_))));
    }

    #[test]
    fn test_revocation_check_can_be_disabled() {
        let identity = FullIdentity::from_seed([4; 32]);
        let db: Arc<dyn RevocationDb> = Arc::new(Revoked(vec![identity.id]));
        let config = ServerConfig {
            revocation_check: false,
            ..ServerConfig::default()
        };
        assert!(Options::new(&identity, &config, db).is_ok());
    }
}
