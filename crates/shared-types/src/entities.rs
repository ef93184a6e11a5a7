//! # Domain Entities
//!
//! Metadata records the satellite subsystems exchange.
//!
//! ## Clusters
//!
//! - **Nodes**: `NodeAddress`, `NodeDossier`, `NodeRecord`
//! - **Metadata**: `Pointer`, `RemotePiece`, `Redundancy`
//! - **Repair & Audit**: `InjuredSegment`, `PendingAudit`
//! - **Accounting**: `ProjectTally`, `NodeTally`, `NodeRollup`
//! - **Orders & Billing**: `OrderLimit`, `BillingTransaction`
//! - **Graceful Exit**: `TransferQueueItem`

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::NodeId;
use crate::version::NodeVersion;

// =============================================================================
// NODES
// =============================================================================

/// Transport used to reach a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Transport {
    #[default]
    TcpTlsGrpc,
}

/// Network address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    pub transport: Transport,
    pub address: String,
}

impl NodeAddress {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::TcpTlsGrpc,
            address: address.into(),
        }
    }
}

/// Role of a node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Satellite,
    Storage,
    Uplink,
}

/// Self-description a node advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDossier {
    pub id: NodeId,
    pub address: NodeAddress,
    pub node_type: NodeType,
    pub version: NodeVersion,
}

/// A storage node as tracked by the overlay cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: NodeAddress,
    pub last_contact_success: Option<DateTime<Utc>>,
    pub last_contact_failure: Option<DateTime<Utc>>,
    pub audit_success_count: u64,
    pub total_audit_count: u64,
    pub disqualified: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(id: NodeId, address: NodeAddress) -> Self {
        Self {
            id,
            address,
            last_contact_success: None,
            last_contact_failure: None,
            audit_success_count: 0,
            total_audit_count: 0,
            disqualified: None,
        }
    }

    /// Fraction of successful audits, 1.0 when never audited.
    #[must_use]
    pub fn audit_success_ratio(&self) -> f64 {
        if self.total_audit_count == 0 {
            return 1.0;
        }
        self.audit_success_count as f64 / self.total_audit_count as f64
    }
}

// =============================================================================
// METADATA
// =============================================================================

/// Erasure coding parameters of a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redundancy {
    /// Pieces required to reconstruct.
    pub min_req: u16,
    /// Repair when healthy pieces drop to this count.
    pub repair_threshold: u16,
    /// Pieces stored on a successful upload.
    pub success_threshold: u16,
    /// Pieces generated.
    pub total: u16,
}

/// One erasure-coded piece stored on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePiece {
    pub piece_num: u16,
    pub node_id: NodeId,
}

/// Where a segment's data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentData {
    /// Data stored inline in the metadata.
    Inline(Vec<u8>),
    /// Data erasure-coded across storage nodes.
    Remote {
        redundancy: Redundancy,
        pieces: Vec<RemotePiece>,
    },
}

/// Metadata for one stored segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub project_id: String,
    pub bucket: String,
    pub segment_size: u64,
    pub data: SegmentData,
    pub created_at: DateTime<Utc>,
}

impl Pointer {
    /// Pieces of a remote segment, empty for inline segments.
    #[must_use]
    pub fn pieces(&self) -> &[RemotePiece] {
        match &self.data {
            SegmentData::Remote { pieces, .. } => pieces,
            SegmentData::Inline(_) => &[],
        }
    }

    #[must_use]
    pub fn redundancy(&self) -> Option<Redundancy> {
        match &self.data {
            SegmentData::Remote { redundancy, .. } => Some(*redundancy),
            SegmentData::Inline(_) => None,
        }
    }

    /// Size of a single piece, 0 for inline segments.
    #[must_use]
    pub fn piece_size(&self) -> u64 {
        match self.redundancy() {
            Some(rs) if rs.min_req > 0 => self.segment_size.div_ceil(u64::from(rs.min_req)),
            _ => 0,
        }
    }
}

// =============================================================================
// REPAIR & AUDIT
// =============================================================================

/// A segment queued for repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjuredSegment {
    pub path: String,
    pub lost_pieces: Vec<u16>,
    pub inserted_at: DateTime<Utc>,
}

/// A segment that could not be repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrreparableSegment {
    pub path: String,
    pub lost_pieces: u16,
    pub repair_attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

/// An audit a node must answer before it is audited for anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAudit {
    pub node_id: NodeId,
    pub path: String,
    pub piece_num: u16,
    pub reverify_count: u32,
}

// =============================================================================
// ACCOUNTING
// =============================================================================

/// Storage held by one bucket at tally time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTally {
    pub project_id: String,
    pub bucket: String,
    pub inline_bytes: u64,
    pub remote_bytes: u64,
    pub segments: u64,
}

/// Bytes at rest on one storage node at tally time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTally {
    pub node_id: NodeId,
    pub at_rest_bytes: u64,
    pub interval_end: DateTime<Utc>,
}

/// Daily aggregate of node tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRollup {
    pub node_id: NodeId,
    pub day: NaiveDate,
    pub at_rest_byte_samples: u64,
    pub samples: u64,
}

// =============================================================================
// ORDERS & BILLING
// =============================================================================

/// What an order limit permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceAction {
    Get,
    GetAudit,
    GetRepair,
    PutRepair,
}

/// A signed permission for a storage node to serve one piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLimit {
    pub serial_number: Uuid,
    pub satellite_id: NodeId,
    pub node_id: NodeId,
    pub piece_num: u16,
    pub action: PieceAction,
    pub limit_bytes: u64,
    pub expires_at: DateTime<Utc>,
    /// Ed25519 signature over the limit with this field empty.
    pub signature: Vec<u8>,
}

/// Status of a payment-provider transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Applied,
}

/// A deposit tracked by the billing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingTransaction {
    pub id: Uuid,
    pub user_id: String,
    pub amount: i64,
    pub received: i64,
    pub status: TransactionStatus,
}

// =============================================================================
// GRACEFUL EXIT
// =============================================================================

/// A piece that must be moved off an exiting node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferQueueItem {
    pub node_id: NodeId,
    pub path: String,
    pub piece_num: u16,
    pub queued_at: DateTime<Utc>,
}
