//! In-memory repository backends.
//!
//! Used by the binary when no persistent store is configured and by tests.
//! Every backend is a `parking_lot` lock around a std collection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use shared_types::{
    Billing, BillingTransaction, Buckets, Containment, DowntimeTracking, GracefulExitDb, InjuredSegment,
    Irreparable, IrreparableSegment, LiveAccounting, NodeAddress, NodeId, NodeRecord, NodeRollup, NodeTally,
    Orders, OverlayCache, PeerIdentities, PeerIdentity, PendingAudit, Pointer, PointerDb, ProjectAccounting,
    ProjectTally, Redundancy, RemotePiece, RepairQueue, Repositories, RevocationDb, SegmentData, StorageError,
    StoragenodeAccounting, TransactionStatus, TransferQueueItem,
};
use uuid::Uuid;

fn not_found(what: impl std::fmt::Display) -> StorageError {
    StorageError::NotFound(what.to_string())
}

// =============================================================================
// EXTERNAL SOURCES
// =============================================================================

#[derive(Default)]
pub struct MemoryPointerDb {
    pointers: RwLock<BTreeMap<String, Pointer>>,
}

#[async_trait]
impl PointerDb for MemoryPointerDb {
    async fn get(&self, path: &str) -> Result<Pointer, StorageError> {
        self.pointers.read().get(path).cloned().ok_or_else(|| not_found(path))
    }

    async fn put(&self, path: &str, pointer: Pointer) -> Result<(), StorageError> {
        self.pointers.write().insert(path.to_string(), pointer);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.pointers.write().remove(path).map(drop).ok_or_else(|| not_found(path))
    }

    async fn list(&self) -> Result<Vec<(String, Pointer)>, StorageError> {
        Ok(self
            .pointers
            .read()
            .iter()
            .map(|(path, pointer)| (path.clone(), pointer.clone()))
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryRevocationDb {
    revoked: RwLock<HashSet<NodeId>>,
}

impl MemoryRevocationDb {
    pub fn revoke(&self, id: NodeId) {
        self.revoked.write().insert(id);
    }
}

impl RevocationDb for MemoryRevocationDb {
    fn is_revoked(&self, node_id: &NodeId) -> Result<bool, StorageError> {
        Ok(self.revoked.read().contains(node_id))
    }
}

#[derive(Default)]
pub struct MemoryLiveAccounting {
    usage: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl LiveAccounting for MemoryLiveAccounting {
    async fn project_storage_usage(&self, project_id: &str) -> Result<i64, StorageError> {
        Ok(self.usage.lock().get(project_id).copied().unwrap_or(0))
    }

    async fn add_project_storage_usage(
        &self,
        project_id: &str,
        inline_space: i64,
        remote_space: i64,
    ) -> Result<(), StorageError> {
        *self.usage.lock().entry(project_id.to_string()).or_default() += inline_space + remote_space;
        Ok(())
    }

    async fn reset_totals(&self) -> Result<(), StorageError> {
        self.usage.lock().clear();
        Ok(())
    }
}

// =============================================================================
// REPOSITORIES
// =============================================================================

#[derive(Default)]
pub struct MemoryOverlayCache {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
}

#[async_trait]
impl OverlayCache for MemoryOverlayCache {
    async fn get(&self, id: &NodeId) -> Result<NodeRecord, StorageError> {
        self.nodes.read().get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn upsert(&self, record: NodeRecord) -> Result<(), StorageError> {
        self.nodes.write().insert(record.id, record);
        Ok(())
    }

    async fn update_check_in(
        &self,
        id: &NodeId,
        address: NodeAddress,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write();
        let record = nodes
            .entry(*id)
            .or_insert_with(|| NodeRecord::new(*id, address.clone()));
        record.address = address;
        if success {
            record.last_contact_success = Some(at);
        } else {
            record.last_contact_failure = Some(at);
        }
        Ok(())
    }

    async fn update_audit_stats(&self, id: &NodeId, success: bool) -> Result<NodeRecord, StorageError> {
        let mut nodes = self.nodes.write();
        let record = nodes.get_mut(id).ok_or_else(|| not_found(id))?;
        record.total_audit_count += 1;
        if success {
            record.audit_success_count += 1;
        }
        Ok(record.clone())
    }

    async fn disqualify(&self, id: &NodeId, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write();
        let record = nodes.get_mut(id).ok_or_else(|| not_found(id))?;
        record.disqualified.get_or_insert(at);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<NodeRecord>, StorageError> {
        Ok(self.nodes.read().values().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryPeerIdentities {
    peers: RwLock<HashMap<NodeId, PeerIdentity>>,
}

#[async_trait]
impl PeerIdentities for MemoryPeerIdentities {
    async fn set(&self, identity: PeerIdentity) -> Result<(), StorageError> {
        self.peers.write().insert(identity.id, identity);
        Ok(())
    }

    async fn get(&self, id: &NodeId) -> Result<PeerIdentity, StorageError> {
        self.peers.read().get(id).cloned().ok_or_else(|| not_found(id))
    }
}

#[derive(Default)]
pub struct MemoryOrders {
    serials: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl MemoryOrders {
    pub fn serial_count(&self) -> usize {
        self.serials.lock().len()
    }
}

#[async_trait]
impl Orders for MemoryOrders {
    async fn create_serial(&self, serial: Uuid, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut serials = self.serials.lock();
        if serials.contains_key(&serial) {
            return Err(StorageError::Conflict(format!("serial {serial}")));
        }
        serials.insert(serial, expires_at);
        Ok(())
    }

    async fn delete_expired_serials(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut serials = self.serials.lock();
        let before = serials.len();
        serials.retain(|_, expires_at| *expires_at >= now);
        Ok(before - serials.len())
    }
}

#[derive(Default)]
pub struct MemoryBuckets {
    buckets: RwLock<HashSet<(String, String)>>,
}

#[async_trait]
impl Buckets for MemoryBuckets {
    async fn create_bucket(&self, project_id: &str, name: &str) -> Result<(), StorageError> {
        if !self.buckets.write().insert((project_id.to_string(), name.to_string())) {
            return Err(StorageError::Conflict(format!("bucket {project_id}/{name}")));
        }
        Ok(())
    }

    async fn bucket_exists(&self, project_id: &str, name: &str) -> Result<bool, StorageError> {
        Ok(self
            .buckets
            .read()
            .contains(&(project_id.to_string(), name.to_string())))
    }
}

#[derive(Default)]
struct RepairQueueState {
    segments: BTreeMap<String, InjuredSegment>,
    in_flight: HashSet<String>,
}

/// Repair queue; `select` hands each segment to one caller until deleted.
#[derive(Default)]
pub struct MemoryRepairQueue {
    state: Mutex<RepairQueueState>,
}

#[async_trait]
impl RepairQueue for MemoryRepairQueue {
    async fn insert(&self, segment: InjuredSegment) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.segments.get_mut(&segment.path) {
            existing.lost_pieces = segment.lost_pieces;
            // Re-inserting releases the segment for another attempt.
            state.in_flight.remove(&segment.path);
            return Ok(true);
        }
        state.segments.insert(segment.path.clone(), segment);
        Ok(false)
    }

    async fn select(&self) -> Result<Option<InjuredSegment>, StorageError> {
        let mut state = self.state.lock();
        let next = state
            .segments
            .values()
            .filter(|segment| !state.in_flight.contains(&segment.path))
            .min_by_key(|segment| segment.inserted_at)
            .cloned();
        if let Some(segment) = &next {
            state.in_flight.insert(segment.path.clone());
        }
        Ok(next)
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.in_flight.remove(path);
        state.segments.remove(path).map(drop).ok_or_else(|| not_found(path))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.state.lock().segments.len())
    }
}

#[derive(Default)]
pub struct MemoryIrreparable {
    segments: Mutex<HashMap<String, IrreparableSegment>>,
}

#[async_trait]
impl Irreparable for MemoryIrreparable {
    async fn increment_repair_attempts(&self, segment: IrreparableSegment) -> Result<(), StorageError> {
        let mut segments = self.segments.lock();
        match segments.get_mut(&segment.path) {
            Some(existing) => {
                existing.repair_attempts += 1;
                existing.lost_pieces = segment.lost_pieces;
                existing.last_attempt = segment.last_attempt;
            }
            None => {
                segments.insert(segment.path.clone(), segment);
            }
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<IrreparableSegment, StorageError> {
        self.segments.lock().get(path).cloned().ok_or_else(|| not_found(path))
    }
}

#[derive(Default)]
pub struct MemoryContainment {
    pending: Mutex<HashMap<NodeId, PendingAudit>>,
}

#[async_trait]
impl Containment for MemoryContainment {
    async fn get(&self, id: &NodeId) -> Result<Option<PendingAudit>, StorageError> {
        Ok(self.pending.lock().get(id).cloned())
    }

    async fn increment_pending(&self, pending: PendingAudit) -> Result<(), StorageError> {
        let mut all = self.pending.lock();
        match all.get_mut(&pending.node_id) {
            Some(existing) if existing.path == pending.path && existing.piece_num == pending.piece_num => {
                existing.reverify_count += 1;
                Ok(())
            }
            Some(_) => Err(StorageError::Conflict(format!(
                "node {} already has a pending audit",
                pending.node_id
            ))),
            None => {
                all.insert(pending.node_id, pending);
                Ok(())
            }
        }
    }

    async fn delete(&self, id: &NodeId) -> Result<bool, StorageError> {
        Ok(self.pending.lock().remove(id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryProjectAccounting {
    latest: Mutex<HashMap<String, i64>>,
    saves: Mutex<Vec<(DateTime<Utc>, Vec<ProjectTally>)>>,
}

impl MemoryProjectAccounting {
    /// Number of tally passes saved.
    pub fn save_count(&self) -> usize {
        self.saves.lock().len()
    }
}

#[async_trait]
impl ProjectAccounting for MemoryProjectAccounting {
    async fn save_tallies(&self, at: DateTime<Utc>, tallies: Vec<ProjectTally>) -> Result<(), StorageError> {
        let mut totals: HashMap<String, i64> = HashMap::new();
        for tally in &tallies {
            let bytes = i64::try_from(tally.inline_bytes + tally.remote_bytes).unwrap_or(i64::MAX);
            *totals.entry(tally.project_id.clone()).or_default() += bytes;
        }
        *self.latest.lock() = totals;
        self.saves.lock().push((at, tallies));
        Ok(())
    }

    async fn project_storage_total(&self, project_id: &str) -> Result<i64, StorageError> {
        Ok(self.latest.lock().get(project_id).copied().unwrap_or(0))
    }
}

#[derive(Default)]
struct NodeAccountingState {
    tallies: Vec<NodeTally>,
    rollups: Vec<NodeRollup>,
    last_rollup: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStoragenodeAccounting {
    state: Mutex<NodeAccountingState>,
}

impl MemoryStoragenodeAccounting {
    pub fn rollups(&self) -> Vec<NodeRollup> {
        self.state.lock().rollups.clone()
    }

    pub fn tally_count(&self) -> usize {
        self.state.lock().tallies.len()
    }
}

#[async_trait]
impl StoragenodeAccounting for MemoryStoragenodeAccounting {
    async fn save_tallies(&self, tallies: Vec<NodeTally>) -> Result<(), StorageError> {
        self.state.lock().tallies.extend(tallies);
        Ok(())
    }

    async fn tallies_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeTally>, StorageError> {
        Ok(self
            .state
            .lock()
            .tallies
            .iter()
            .filter(|tally| since.map_or(true, |since| tally.interval_end > since))
            .cloned()
            .collect())
    }

    async fn save_rollups(&self, latest: DateTime<Utc>, rollups: Vec<NodeRollup>) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.rollups.extend(rollups);
        state.last_rollup = Some(latest);
        Ok(())
    }

    async fn last_rollup(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.state.lock().last_rollup)
    }

    async fn delete_tallies_before(&self, before: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut state = self.state.lock();
        let count = state.tallies.len();
        state.tallies.retain(|tally| tally.interval_end >= before);
        Ok(count - state.tallies.len())
    }
}

#[derive(Default)]
pub struct MemoryBilling {
    transactions: Mutex<HashMap<Uuid, BillingTransaction>>,
    balances: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl Billing for MemoryBilling {
    async fn insert_transaction(&self, tx: BillingTransaction) -> Result<(), StorageError> {
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&tx.id) {
            return Err(StorageError::Conflict(format!("transaction {}", tx.id)));
        }
        transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn transactions_with_status(
        &self,
        status: TransactionStatus,
    ) -> Result<Vec<BillingTransaction>, StorageError> {
        Ok(self
            .transactions
            .lock()
            .values()
            .filter(|tx| tx.status == status)
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: Uuid, status: TransactionStatus) -> Result<(), StorageError> {
        let mut transactions = self.transactions.lock();
        let tx = transactions.get_mut(&id).ok_or_else(|| not_found(id))?;
        tx.status = status;
        Ok(())
    }

    async fn add_balance(&self, user_id: &str, amount: i64) -> Result<(), StorageError> {
        *self.balances.lock().entry(user_id.to_string()).or_default() += amount;
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> Result<i64, StorageError> {
        Ok(self.balances.lock().get(user_id).copied().unwrap_or(0))
    }
}

#[derive(Default)]
struct GracefulExitState {
    /// Exiting nodes and whether their transfer queue has been built.
    exiting: BTreeMap<NodeId, (DateTime<Utc>, bool)>,
    queue: Vec<TransferQueueItem>,
}

#[derive(Default)]
pub struct MemoryGracefulExit {
    state: Mutex<GracefulExitState>,
}

#[async_trait]
impl GracefulExitDb for MemoryGracefulExit {
    async fn begin_exit(&self, id: &NodeId, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.state.lock().exiting.entry(*id).or_insert((at, false));
        Ok(())
    }

    async fn nodes_awaiting_queue(&self) -> Result<Vec<NodeId>, StorageError> {
        Ok(self
            .state
            .lock()
            .exiting
            .iter()
            .filter(|(_, (_, built))| !built)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn enqueue(&self, items: Vec<TransferQueueItem>) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        for item in items {
            let duplicate = state
                .queue
                .iter()
                .any(|q| q.node_id == item.node_id && q.path == item.path && q.piece_num == item.piece_num);
            if !duplicate {
                state.queue.push(item);
            }
        }
        Ok(())
    }

    async fn mark_queue_built(&self, id: &NodeId) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let entry = state.exiting.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.1 = true;
        Ok(())
    }

    async fn queue_len(&self, id: &NodeId) -> Result<usize, StorageError> {
        Ok(self.state.lock().queue.iter().filter(|item| item.node_id == *id).count())
    }
}

#[derive(Default)]
pub struct MemoryDowntimeTracking {
    totals: Mutex<HashMap<NodeId, i64>>,
}

#[async_trait]
impl DowntimeTracking for MemoryDowntimeTracking {
    async fn add(&self, id: &NodeId, _tracked_at: DateTime<Utc>, seconds: i64) -> Result<(), StorageError> {
        *self.totals.lock().entry(*id).or_default() += seconds;
        Ok(())
    }

    async fn total(&self, id: &NodeId) -> Result<i64, StorageError> {
        Ok(self.totals.lock().get(id).copied().unwrap_or(0))
    }
}

// =============================================================================
// AGGREGATE
// =============================================================================

/// Every repository backed by memory; individual ports can be swapped.
#[derive(Clone)]
pub struct MemoryRepositories {
    overlay_cache: Arc<dyn OverlayCache>,
    peer_identities: Arc<dyn PeerIdentities>,
    orders: Arc<dyn Orders>,
    buckets: Arc<dyn Buckets>,
    repair_queue: Arc<dyn RepairQueue>,
    irreparable: Arc<dyn Irreparable>,
    containment: Arc<dyn Containment>,
    project_accounting: Arc<dyn ProjectAccounting>,
    storagenode_accounting: Arc<dyn StoragenodeAccounting>,
    billing: Arc<dyn Billing>,
    graceful_exit: Arc<dyn GracefulExitDb>,
    downtime_tracking: Arc<dyn DowntimeTracking>,
}

impl Default for MemoryRepositories {
    fn default() -> Self {
        Self {
            overlay_cache: Arc::new(MemoryOverlayCache::default()),
            peer_identities: Arc::new(MemoryPeerIdentities::default()),
            orders: Arc::new(MemoryOrders::default()),
            buckets: Arc::new(MemoryBuckets::default()),
            repair_queue: Arc::new(MemoryRepairQueue::default()),
            irreparable: Arc::new(MemoryIrreparable::default()),
            containment: Arc::new(MemoryContainment::default()),
            project_accounting: Arc::new(MemoryProjectAccounting::default()),
            storagenode_accounting: Arc::new(MemoryStoragenodeAccounting::default()),
            billing: Arc::new(MemoryBilling::default()),
            graceful_exit: Arc::new(MemoryGracefulExit::default()),
            downtime_tracking: Arc::new(MemoryDowntimeTracking::default()),
        }
    }
}

impl MemoryRepositories {
    pub fn with_overlay_cache(mut self, overlay_cache: Arc<dyn OverlayCache>) -> Self {
        self.overlay_cache = overlay_cache;
        self
    }

    pub fn with_orders(mut self, orders: Arc<dyn Orders>) -> Self {
        self.orders = orders;
        self
    }

    pub fn with_storagenode_accounting(mut self, accounting: Arc<dyn StoragenodeAccounting>) -> Self {
        self.storagenode_accounting = accounting;
        self
    }

    pub fn with_graceful_exit(mut self, graceful_exit: Arc<dyn GracefulExitDb>) -> Self {
        self.graceful_exit = graceful_exit;
        self
    }
}

impl Repositories for MemoryRepositories {
    fn overlay_cache(&self) -> Arc<dyn OverlayCache> {
        Arc::clone(&self.overlay_cache)
    }

    fn peer_identities(&self) -> Arc<dyn PeerIdentities> {
        Arc::clone(&self.peer_identities)
    }

    fn orders(&self) -> Arc<dyn Orders> {
        Arc::clone(&self.orders)
    }

    fn buckets(&self) -> Arc<dyn Buckets> {
        Arc::clone(&self.buckets)
    }

    fn repair_queue(&self) -> Arc<dyn RepairQueue> {
        Arc::clone(&self.repair_queue)
    }

    fn irreparable(&self) -> Arc<dyn Irreparable> {
        Arc::clone(&self.irreparable)
    }

    fn containment(&self) -> Arc<dyn Containment> {
        Arc::clone(&self.containment)
    }

    fn project_accounting(&self) -> Arc<dyn ProjectAccounting> {
        Arc::clone(&self.project_accounting)
    }

    fn storagenode_accounting(&self) -> Arc<dyn StoragenodeAccounting> {
        Arc::clone(&self.storagenode_accounting)
    }

    fn billing(&self) -> Arc<dyn Billing> {
        Arc::clone(&self.billing)
    }

    fn graceful_exit(&self) -> Arc<dyn GracefulExitDb> {
        Arc::clone(&self.graceful_exit)
    }

    fn downtime_tracking(&self) -> Arc<dyn DowntimeTracking> {
        Arc::clone(&self.downtime_tracking)
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

/// Redundancy used by [`remote_pointer`]: 2 needed, repair at 3, 4 on upload, 6 total.
pub const FIXTURE_REDUNDANCY: Redundancy = Redundancy {
    min_req: 2,
    repair_threshold: 3,
    success_threshold: 4,
    total: 6,
};

/// A 1 KiB remote segment with piece `i` stored on `NodeId([node_seeds[i]; 32])`.
pub fn remote_pointer(project_id: &str, bucket: &str, node_seeds: &[u8]) -> Pointer {
    let pieces = node_seeds
        .iter()
        .zip(0u16..)
        .map(|(seed, piece_num)| RemotePiece {
            piece_num,
            node_id: NodeId([*seed; 32]),
        })
        .collect();

    Pointer {
        project_id: project_id.to_string(),
        bucket: bucket.to_string(),
        segment_size: 1024,
        data: SegmentData::Remote {
            redundancy: FIXTURE_REDUNDANCY,
            pieces,
        },
        created_at: Utc::now(),
    }
}

pub fn inline_pointer(project_id: &str, bucket: &str, data: &[u8]) -> Pointer {
    Pointer {
        project_id: project_id.to_string(),
        bucket: bucket.to_string(),
        segment_size: data.len() as u64,
        data: SegmentData::Inline(data.to_vec()),
        created_at: Utc::now(),
    }
}
