//! # Node Identity
//!
//! Long-lived Ed25519 key material identifying a satellite. The node ID is
//! the SHA-256 digest of the public key, so it is fixed the moment the
//! identity exists and can be handed to every construction step.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier for a node in the network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Derive the node ID from a public key.
    #[must_use]
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(Sha256::digest(key.as_bytes()).into())
    }

    /// Parse the 64-character hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Self(bytes))
    }

    /// True for the all-zero ID.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..6]))
    }
}

/// Public half of an identity, as seen by other nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: NodeId,
    pub public_key: VerifyingKey,
}

impl PeerIdentity {
    /// Verify a signature produced by this peer.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.public_key.verify(message, signature).is_ok()
    }
}

/// Full identity including the private key.
pub struct FullIdentity {
    pub id: NodeId,
    signing_key: SigningKey,
}

impl FullIdentity {
    /// Generate a fresh identity from the OS random source.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let id = NodeId::from_public_key(&signing_key.verifying_key());
        Self { id, signing_key }
    }

    /// Public part of this identity.
    #[must_use]
    pub fn peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            id: self.id,
            public_key: self.signing_key.verifying_key(),
        }
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for FullIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullIdentity").field("id", &self.id).finish_non_exhaustive()
    }
}
