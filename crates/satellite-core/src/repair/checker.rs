//! Repair checker.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use shared_types::{InjuredSegment, Irreparable, IrreparableSegment, NodeId, Pointer, RepairQueue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chore::Cycle;
use crate::container::config::CheckerConfig;
use crate::metainfo::{Loop, Observer};
use crate::overlay;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

/// Outcome of one checker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckerStats {
    pub remote_segments_checked: u64,
    pub injured: u64,
    pub newly_queued: u64,
    pub irreparable: u64,
}

struct CheckerObserver {
    reliable: HashSet<NodeId>,
    repair_override: u16,
    repair_queue: Arc<dyn RepairQueue>,
    irreparable: Arc<dyn Irreparable>,
    stats: Mutex<CheckerStats>,
}

#[async_trait]
impl Observer for CheckerObserver {
    async fn remote_segment(&self, path: &str, pointer: &Pointer) -> Result<(), SubsystemError> {
        self.stats.lock().remote_segments_checked += 1;

        let Some(redundancy) = pointer.redundancy() else {
            return Ok(());
        };
        let missing: Vec<u16> = pointer
            .pieces()
            .iter()
            .filter(|piece| !self.reliable.contains(&piece.node_id))
            .map(|piece| piece.piece_num)
            .collect();
        let healthy = pointer.pieces().len() - missing.len();

        let threshold = match self.repair_override {
            0 => redundancy.repair_threshold,
            value => value,
        };

        if healthy < usize::from(redundancy.min_req) {
            self.irreparable
                .increment_repair_attempts(IrreparableSegment {
                    path: path.to_string(),
                    lost_pieces: u16::try_from(missing.len()).unwrap_or(u16::MAX),
                    repair_attempts: 1,
                    last_attempt: Utc::now(),
                })
                .await?;
            self.stats.lock().irreparable += 1;
            debug!(subsystem = "checker", path, healthy, "Segment irreparable");
        } else if healthy <= usize::from(threshold) && healthy < usize::from(redundancy.success_threshold) {
            let already_queued = self
                .repair_queue
                .insert(InjuredSegment {
                    path: path.to_string(),
                    lost_pieces: missing,
                    inserted_at: Utc::now(),
                })
                .await?;
            let mut stats = self.stats.lock();
            stats.injured += 1;
            if !already_queued {
                stats.newly_queued += 1;
            }
        }
        Ok(())
    }
}

pub struct Checker {
    metainfo_loop: Arc<Loop>,
    overlay: Arc<overlay::Service>,
    repair_queue: Arc<dyn RepairQueue>,
    irreparable: Arc<dyn Irreparable>,
    repair_override: u16,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Checker {
    pub fn new(
        metainfo_loop: Arc<Loop>,
        overlay: Arc<overlay::Service>,
        repair_queue: Arc<dyn RepairQueue>,
        irreparable: Arc<dyn Irreparable>,
        config: &CheckerConfig,
    ) -> Self {
        Self {
            metainfo_loop,
            overlay,
            repair_queue,
            irreparable,
            repair_override: config.repair_override,
            cycle: Cycle::new(config.interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Check every remote segment against the currently reliable nodes.
    pub async fn identify_injured_segments(&self, token: &CancellationToken) -> Result<CheckerStats, SubsystemError> {
        let observer = Arc::new(CheckerObserver {
            reliable: self.overlay.reliable().await?,
            repair_override: self.repair_override,
            repair_queue: Arc::clone(&self.repair_queue),
            irreparable: Arc::clone(&self.irreparable),
            stats: Mutex::new(CheckerStats::default()),
        });
        self.metainfo_loop.join(token, observer.clone()).await?;

        let stats = *observer.stats.lock();
        info!(
            subsystem = "checker",
            checked = stats.remote_segments_checked,
            injured = stats.injured,
            queued = stats.newly_queued,
            irreparable = stats.irreparable,
            "Checker pass complete"
        );
        Ok(stats)
    }
}

#[async_trait]
impl Subsystem for Checker {
    fn id(&self) -> SubsystemId {
        SubsystemId::RepairChecker
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        let token = &token;
        self.cycle
            .run(token, move || async move { self.identify_injured_segments(token).await.map(drop) })
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
