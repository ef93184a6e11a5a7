//! Segment repairer.
//!
//! Drains the repair queue with at most `max_repair` segments in flight. A
//! repair keeps every piece held by a reliable node, drops the rest and
//! assigns replacement pieces to reliable nodes that hold nothing of the
//! segment yet, up to the success threshold plus the configured excess.
//! Piece transfer itself is the storage node protocol's job; the repairer
//! issues the order limits for it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use shared_types::{
    InjuredSegment, Irreparable, IrreparableSegment, PieceAction, RemotePiece, RepairQueue, StorageError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chore::Cycle;
use crate::container::config::RepairerConfig;
use crate::metainfo;
use crate::orders;
use crate::overlay;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

/// What a single repair attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Pieces were replaced.
    Repaired { added: usize, removed: usize },
    /// Nothing to do: the segment is gone or already healthy.
    Skipped,
    /// Too few healthy pieces remain to reconstruct the segment.
    Irreparable,
}

pub struct SegmentRepairer {
    metainfo: Arc<metainfo::Service>,
    orders: Arc<orders::Service>,
    overlay: Arc<overlay::Service>,
    irreparable: Arc<dyn Irreparable>,
    max_excess_rate: f64,
}

impl SegmentRepairer {
    pub fn new(
        metainfo: Arc<metainfo::Service>,
        orders: Arc<orders::Service>,
        overlay: Arc<overlay::Service>,
        irreparable: Arc<dyn Irreparable>,
        config: &RepairerConfig,
    ) -> Self {
        Self {
            metainfo,
            orders,
            overlay,
            irreparable,
            max_excess_rate: config.max_excess_rate_optimal_threshold,
        }
    }

    pub async fn repair(&self, path: &str) -> Result<RepairOutcome, SubsystemError> {
        let pointer = match self.metainfo.get(path).await {
            Ok(pointer) => pointer,
            Err(StorageError::NotFound(_)) => return Ok(RepairOutcome::Skipped),
            Err(err) => return Err(err.into()),
        };
        let Some(redundancy) = pointer.redundancy() else {
            return Ok(RepairOutcome::Skipped);
        };

        let reliable = self.overlay.reliable().await?;
        let (healthy, unhealthy): (Vec<RemotePiece>, Vec<RemotePiece>) = pointer
            .pieces()
            .iter()
            .copied()
            .partition(|piece| reliable.contains(&piece.node_id));

        if healthy.len() < usize::from(redundancy.min_req) {
            self.irreparable
                .increment_repair_attempts(IrreparableSegment {
                    path: path.to_string(),
                    lost_pieces: u16::try_from(unhealthy.len()).unwrap_or(u16::MAX),
                    repair_attempts: 1,
                    last_attempt: chrono::Utc::now(),
                })
                .await?;
            return Ok(RepairOutcome::Irreparable);
        }

        let optimal = (f64::from(redundancy.success_threshold) * (1.0 + self.max_excess_rate)).ceil() as usize;
        let target = optimal.min(usize::from(redundancy.total));
        if healthy.len() >= target {
            return Ok(RepairOutcome::Skipped);
        }

        // Download limits for the pieces the repair reads from.
        for piece in healthy.iter().take(usize::from(redundancy.min_req)) {
            self.orders
                .create_order_limit(piece.node_id, piece.piece_num, PieceAction::GetRepair, pointer.piece_size())
                .await?;
        }

        let holders: HashSet<_> = pointer.pieces().iter().map(|p| p.node_id).collect();
        let mut candidates: Vec<_> = reliable.difference(&holders).copied().collect();
        candidates.sort();

        let used: HashSet<u16> = healthy.iter().map(|p| p.piece_num).collect();
        let free_nums = (0..redundancy.total).filter(|n| !used.contains(n));

        let mut added = Vec::new();
        for (node_id, piece_num) in candidates.into_iter().zip(free_nums).take(target - healthy.len()) {
            self.orders
                .create_order_limit(node_id, piece_num, PieceAction::PutRepair, pointer.piece_size())
                .await?;
            added.push(RemotePiece { piece_num, node_id });
        }

        if added.is_empty() && unhealthy.is_empty() {
            return Ok(RepairOutcome::Skipped);
        }

        let removed: Vec<u16> = unhealthy.iter().map(|p| p.piece_num).collect();
        let outcome = RepairOutcome::Repaired {
            added: added.len(),
            removed: removed.len(),
        };
        self.metainfo.update_pieces(path, added, &removed).await?;
        Ok(outcome)
    }
}

pub struct Repairer {
    queue: Arc<dyn RepairQueue>,
    segments: SegmentRepairer,
    max_repair: usize,
    timeout: Duration,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Repairer {
    pub fn new(queue: Arc<dyn RepairQueue>, segments: SegmentRepairer, config: &RepairerConfig) -> Self {
        Self {
            queue,
            segments,
            max_repair: config.max_repair.max(1),
            timeout: config.timeout(),
            cycle: Cycle::new(config.interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Repair everything currently queued.
    pub async fn process_queue(&self) -> Result<usize, SubsystemError> {
        let mut batch = Vec::new();
        while let Some(segment) = self.queue.select().await? {
            batch.push(segment);
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let attempted = batch.len();
        futures::stream::iter(batch)
            .for_each_concurrent(self.max_repair, |segment| self.process_segment(segment))
            .await;

        info!(subsystem = "repairer", attempted, "Repair batch complete");
        Ok(attempted)
    }

    async fn process_segment(&self, segment: InjuredSegment) {
        let path = segment.path.clone();
        let result = tokio::time::timeout(self.timeout, self.segments.repair(&path)).await;

        let done = match result {
            Ok(Ok(outcome)) => {
                debug!(subsystem = "repairer", path = %path, ?outcome, "Segment processed");
                true
            }
            Ok(Err(err)) => {
                warn!(subsystem = "repairer", path = %path, error = %err, "Repair failed");
                false
            }
            Err(_) => {
                warn!(subsystem = "repairer", path = %path, timeout = ?self.timeout, "Repair timed out");
                false
            }
        };

        let requeue = if done {
            self.queue.delete(&path).await
        } else {
            self.queue.insert(segment).await.map(drop)
        };
        if let Err(err) = requeue {
            warn!(subsystem = "repairer", path = %path, error = %err, "Repair queue update failed");
        }
    }
}

#[async_trait]
impl Subsystem for Repairer {
    fn id(&self) -> SubsystemId {
        SubsystemId::Repairer
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        self.cycle
            .run(&token, move || async move { self.process_queue().await.map(drop) })
            .await
    }

    fn close(&self) -> Result<(), SubsystemError> {
        self.lifecycle.stop();
        self.cycle.stop();
        Ok(())
    }

    fn state(&self) -> SubsystemState {
        self.lifecycle.state()
    }
}
