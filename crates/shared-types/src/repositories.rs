//! # Repository Ports
//!
//! Storage contracts consumed by satellite subsystems. Each subsystem is handed
//! only the repositories it needs; `Repositories` is the aggregate the process
//! builds once and shares read-only.
//!
//! | Port | Consumers |
//! |------|-----------|
//! | `OverlayCache` | overlay, GC, graceful exit |
//! | `PeerIdentities` | contact |
//! | `Orders` | orders, db cleanup |
//! | `Buckets` | metainfo |
//! | `RepairQueue` / `Irreparable` | repair checker, repairer |
//! | `Containment` | audit verifier and reporter |
//! | `ProjectAccounting` / `StoragenodeAccounting` | tally, rollup, usage, billing |
//! | `Billing` | billing provider |
//! | `GracefulExitDb` | graceful exit |
//! | `DowntimeTracking` | downtime detection |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{
    BillingTransaction, InjuredSegment, IrreparableSegment, NodeAddress, NodeRecord, NodeRollup,
    NodeTally, PendingAudit, Pointer, ProjectTally, TransactionStatus, TransferQueueItem,
};
use crate::errors::StorageError;
use crate::identity::{NodeId, PeerIdentity};

// =============================================================================
// EXTERNAL SOURCES (not part of the repository aggregate)
// =============================================================================

/// Segment metadata store.
#[async_trait]
pub trait PointerDb: Send + Sync {
    async fn get(&self, path: &str) -> Result<Pointer, StorageError>;
    async fn put(&self, path: &str, pointer: Pointer) -> Result<(), StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
    /// All segments ordered by path.
    async fn list(&self) -> Result<Vec<(String, Pointer)>, StorageError>;
}

/// Source of revoked certificate chains.
pub trait RevocationDb: Send + Sync {
    fn is_revoked(&self, node_id: &NodeId) -> Result<bool, StorageError>;
}

/// Near-real-time usage counters shared by several subsystems.
#[async_trait]
pub trait LiveAccounting: Send + Sync {
    async fn project_storage_usage(&self, project_id: &str) -> Result<i64, StorageError>;
    async fn add_project_storage_usage(
        &self,
        project_id: &str,
        inline_space: i64,
        remote_space: i64,
    ) -> Result<(), StorageError>;
    async fn reset_totals(&self) -> Result<(), StorageError>;
}

// =============================================================================
// REPOSITORIES
// =============================================================================

#[async_trait]
pub trait OverlayCache: Send + Sync {
    async fn get(&self, id: &NodeId) -> Result<NodeRecord, StorageError>;
    async fn upsert(&self, record: NodeRecord) -> Result<(), StorageError>;
    async fn update_check_in(
        &self,
        id: &NodeId,
        address: NodeAddress,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
    async fn update_audit_stats(&self, id: &NodeId, success: bool) -> Result<NodeRecord, StorageError>;
    async fn disqualify(&self, id: &NodeId, at: DateTime<Utc>) -> Result<(), StorageError>;
    async fn all(&self) -> Result<Vec<NodeRecord>, StorageError>;
}

#[async_trait]
pub trait PeerIdentities: Send + Sync {
    async fn set(&self, identity: PeerIdentity) -> Result<(), StorageError>;
    async fn get(&self, id: &NodeId) -> Result<PeerIdentity, StorageError>;
}

#[async_trait]
pub trait Orders: Send + Sync {
    async fn create_serial(&self, serial: Uuid, expires_at: DateTime<Utc>) -> Result<(), StorageError>;
    /// Removes serials that expired before `now`, returning how many.
    async fn delete_expired_serials(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait Buckets: Send + Sync {
    async fn create_bucket(&self, project_id: &str, name: &str) -> Result<(), StorageError>;
    async fn bucket_exists(&self, project_id: &str, name: &str) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait RepairQueue: Send + Sync {
    /// Returns true when the segment was already queued.
    async fn insert(&self, segment: InjuredSegment) -> Result<bool, StorageError>;
    async fn select(&self) -> Result<Option<InjuredSegment>, StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
    async fn count(&self) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait Irreparable: Send + Sync {
    async fn increment_repair_attempts(&self, segment: IrreparableSegment) -> Result<(), StorageError>;
    async fn get(&self, path: &str) -> Result<IrreparableSegment, StorageError>;
}

#[async_trait]
pub trait Containment: Send + Sync {
    async fn get(&self, id: &NodeId) -> Result<Option<PendingAudit>, StorageError>;
    async fn increment_pending(&self, pending: PendingAudit) -> Result<(), StorageError>;
    /// Returns true when a pending audit was removed.
    async fn delete(&self, id: &NodeId) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait ProjectAccounting: Send + Sync {
    async fn save_tallies(&self, at: DateTime<Utc>, tallies: Vec<ProjectTally>) -> Result<(), StorageError>;
    /// Bytes stored by a project as of the latest tally.
    async fn project_storage_total(&self, project_id: &str) -> Result<i64, StorageError>;
}

#[async_trait]
pub trait StoragenodeAccounting: Send + Sync {
    async fn save_tallies(&self, tallies: Vec<NodeTally>) -> Result<(), StorageError>;
    async fn tallies_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeTally>, StorageError>;
    async fn save_rollups(&self, latest: DateTime<Utc>, rollups: Vec<NodeRollup>) -> Result<(), StorageError>;
    async fn last_rollup(&self) -> Result<Option<DateTime<Utc>>, StorageError>;
    async fn delete_tallies_before(&self, before: DateTime<Utc>) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait Billing: Send + Sync {
    async fn insert_transaction(&self, tx: BillingTransaction) -> Result<(), StorageError>;
    async fn transactions_with_status(
        &self,
        status: TransactionStatus,
    ) -> Result<Vec<BillingTransaction>, StorageError>;
    async fn update_status(&self, id: Uuid, status: TransactionStatus) -> Result<(), StorageError>;
    async fn add_balance(&self, user_id: &str, amount: i64) -> Result<(), StorageError>;
    async fn balance(&self, user_id: &str) -> Result<i64, StorageError>;
}

#[async_trait]
pub trait GracefulExitDb: Send + Sync {
    async fn begin_exit(&self, id: &NodeId, at: DateTime<Utc>) -> Result<(), StorageError>;
    /// Exiting nodes whose transfer queue has not been built yet.
    async fn nodes_awaiting_queue(&self) -> Result<Vec<NodeId>, StorageError>;
    async fn enqueue(&self, items: Vec<TransferQueueItem>) -> Result<(), StorageError>;
    async fn mark_queue_built(&self, id: &NodeId) -> Result<(), StorageError>;
    async fn queue_len(&self, id: &NodeId) -> Result<usize, StorageError>;
}

#[async_trait]
pub trait DowntimeTracking: Send + Sync {
    async fn add(&self, id: &NodeId, tracked_at: DateTime<Utc>, seconds: i64) -> Result<(), StorageError>;
    async fn total(&self, id: &NodeId) -> Result<i64, StorageError>;
}

/// Aggregate of every repository the satellite core hands out.
pub trait Repositories: Send + Sync {
    fn overlay_cache(&self) -> Arc<dyn OverlayCache>;
    fn peer_identities(&self) -> Arc<dyn PeerIdentities>;
    fn orders(&self) -> Arc<dyn Orders>;
    fn buckets(&self) -> Arc<dyn Buckets>;
    fn repair_queue(&self) -> Arc<dyn RepairQueue>;
    fn irreparable(&self) -> Arc<dyn Irreparable>;
    fn containment(&self) -> Arc<dyn Containment>;
    fn project_accounting(&self) -> Arc<dyn ProjectAccounting>;
    fn storagenode_accounting(&self) -> Arc<dyn StoragenodeAccounting>;
    fn billing(&self) -> Arc<dyn Billing>;
    fn graceful_exit(&self) -> Arc<dyn GracefulExitDb>;
    fn downtime_tracking(&self) -> Arc<dyn DowntimeTracking>;
}
