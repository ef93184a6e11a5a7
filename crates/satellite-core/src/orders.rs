//! Order limits: signed permissions for storage nodes to serve pieces.
//!
//! Every limit carries a fresh serial number that is recorded with its
//! expiration so the node cannot settle the same order twice; the db cleanup
//! chore removes serials once they expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::Signature;
use shared_types::{FullIdentity, NodeId, OrderLimit, Orders, PeerIdentity, PieceAction, Pointer, StorageError};
use uuid::Uuid;

use crate::container::config::OrdersConfig;

pub struct Service {
    identity: Arc<FullIdentity>,
    orders: Arc<dyn Orders>,
    expiration: Duration,
}

impl Service {
    pub fn new(identity: Arc<FullIdentity>, orders: Arc<dyn Orders>, config: &OrdersConfig) -> Self {
        Self {
            identity,
            orders,
            expiration: config.expiration(),
        }
    }

    /// Create, record and sign one order limit.
    pub async fn create_order_limit(
        &self,
        node_id: NodeId,
        piece_num: u16,
        action: PieceAction,
        limit_bytes: u64,
    ) -> Result<OrderLimit, StorageError> {
        let expiration = chrono::Duration::from_std(self.expiration)
            .map_err(|e| StorageError::Backend(format!("order expiration: {e}")))?;
        let expires_at = Utc::now() + expiration;
        let serial_number = Uuid::new_v4();
        self.orders.create_serial(serial_number, expires_at).await?;

        let mut limit = OrderLimit {
            serial_number,
            satellite_id: self.identity.id,
            node_id,
            piece_num,
            action,
            limit_bytes,
            expires_at,
            signature: Vec::new(),
        };
        limit.signature = self.identity.sign(&signing_bytes(&limit)).to_bytes().to_vec();
        Ok(limit)
    }

    /// One limit per piece of a remote segment.
    pub async fn create_limits_for_segment(
        &self,
        pointer: &Pointer,
        action: PieceAction,
    ) -> Result<Vec<OrderLimit>, StorageError> {
        let piece_size = pointer.piece_size();
        let mut limits = Vec::with_capacity(pointer.pieces().len());
        for piece in pointer.pieces() {
            limits.push(
                self.create_order_limit(piece.node_id, piece.piece_num, action, piece_size)
                    .await?,
            );
        }
        Ok(limits)
    }
}

/// Check a limit's signature against the issuing satellite.
pub fn verify_order_limit(satellite: &PeerIdentity, limit: &OrderLimit) -> bool {
    let Ok(bytes) = <[u8; 64]>::try_from(limit.signature.as_slice()) else {
        return false;
    };
    satellite.id == limit.satellite_id && satellite.verify(&signing_bytes(limit), &Signature::from_bytes(&bytes))
}

/// Canonical bytes signed for a limit: every field except the signature.
fn signing_bytes(limit: &OrderLimit) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(128);
    bytes.extend_from_slice(limit.serial_number.as_bytes());
    bytes.extend_from_slice(&limit.satellite_id.0);
    bytes.extend_from_slice(&limit.node_id.0);
    bytes.extend_from_slice(&limit.piece_num.to_le_bytes());
    bytes.push(match limit.action {
        PieceAction::Get => 0,
        PieceAction::GetAudit => 1,
        PieceAction::GetRepair => 2,
        PieceAction::PutRepair => 3,
    });
    bytes.extend_from_slice(&limit.limit_bytes.to_le_bytes());
    bytes.extend_from_slice(&limit.expires_at.timestamp_millis().to_le_bytes());
    bytes
}
