//! Records audit outcomes in the overlay and the containment mode.

use std::sync::Arc;

use shared_types::{Containment, NodeId, PendingAudit, StorageError};
use tracing::{debug, warn};

use super::verifier::Report;
use crate::container::config::AuditConfig;
use crate::overlay;

pub struct Reporter {
    overlay: Arc<overlay::Service>,
    containment: Arc<dyn Containment>,
    max_retries: u32,
    max_reverify_count: u32,
}

impl Reporter {
    pub fn new(overlay: Arc<overlay::Service>, containment: Arc<dyn Containment>, config: &AuditConfig) -> Self {
        Self {
            overlay,
            containment,
            max_retries: config.max_retries_stat_db,
            max_reverify_count: config.max_reverify_count,
        }
    }

    /// Record every outcome in `report`, retrying entries that could not be
    /// stored. Returns what is still unrecorded after the last attempt.
    pub async fn record_audits(&self, report: Report) -> Report {
        let mut remaining = report;
        let mut attempt = 0;

        while !remaining.is_empty() && attempt <= self.max_retries {
            if attempt > 0 {
                debug!(subsystem = "audit:worker", attempt, "Retrying audit report");
            }
            remaining = self.record_once(remaining).await;
            attempt += 1;
        }

        if !remaining.is_empty() {
            warn!(
                subsystem = "audit:worker",
                successes = remaining.successes.len(),
                fails = remaining.fails.len(),
                offlines = remaining.offlines.len(),
                pending = remaining.pending_audits.len(),
                "Failed to record audit results"
            );
        }
        remaining
    }

    async fn record_once(&self, report: Report) -> Report {
        let mut failed = Report::default();

        for id in report.successes {
            if self.record_result(&id, true).await.is_err() {
                failed.successes.push(id);
            }
        }
        for id in report.fails {
            if self.record_result(&id, false).await.is_err() {
                failed.fails.push(id);
            }
        }
        for id in report.offlines {
            if self.record_offline(&id).await.is_err() {
                failed.offlines.push(id);
            }
        }
        for pending in report.pending_audits {
            if self.record_pending(&pending).await.is_err() {
                failed.pending_audits.push(pending);
            }
        }

        failed
    }

    /// A definitive audit result also releases the node from containment.
    async fn record_result(&self, id: &NodeId, success: bool) -> Result<(), StorageError> {
        self.overlay.update_stats(id, success).await?;
        self.containment.delete(id).await?;
        Ok(())
    }

    async fn record_offline(&self, id: &NodeId) -> Result<(), StorageError> {
        let record = self.overlay.get(id).await?;
        self.overlay.update_check_in(id, record.address, false).await
    }

    async fn record_pending(&self, pending: &PendingAudit) -> Result<(), StorageError> {
        if pending.reverify_count >= self.max_reverify_count {
            warn!(
                subsystem = "audit:worker",
                node = %pending.node_id,
                path = %pending.path,
                "Contained node exhausted its reverifications"
            );
            return self.record_result(&pending.node_id, false).await;
        }
        self.containment.increment_pending(pending.clone()).await
    }
}
