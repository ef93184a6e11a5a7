//! Audit verification.
//!
//! For each piece of a segment the verifier obtains an audit order limit and
//! contacts the holding node within the download timeout. Nodes that refuse
//! the connection are offline; nodes that accept but do not finish within
//! the timeout are contained and must answer the same audit on a later pass.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use shared_types::{Containment, NodeId, PendingAudit, PieceAction, StorageError};
use tracing::debug;

use crate::container::config::AuditConfig;
use crate::metainfo;
use crate::orders;
use crate::overlay;
use crate::registry::SubsystemError;
use crate::rpc::Dialer;

/// Outcome of auditing one segment, grouped by node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub successes: Vec<NodeId>,
    pub fails: Vec<NodeId>,
    pub offlines: Vec<NodeId>,
    pub pending_audits: Vec<PendingAudit>,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.fails.is_empty() && self.offlines.is_empty() && self.pending_audits.is_empty()
    }
}

pub struct Verifier {
    metainfo: Arc<metainfo::Service>,
    orders: Arc<orders::Service>,
    overlay: Arc<overlay::Service>,
    containment: Arc<dyn Containment>,
    dialer: Dialer,
    min_bytes_per_second: u64,
    min_download_timeout: Duration,
}

impl Verifier {
    pub fn new(
        metainfo: Arc<metainfo::Service>,
        orders: Arc<orders::Service>,
        overlay: Arc<overlay::Service>,
        containment: Arc<dyn Containment>,
        dialer: Dialer,
        config: &AuditConfig,
    ) -> Self {
        Self {
            metainfo,
            orders,
            overlay,
            containment,
            dialer,
            min_bytes_per_second: config.min_bytes_per_second.max(1),
            min_download_timeout: config.min_download_timeout(),
        }
    }

    /// Time allowed to fetch one piece of `piece_size` bytes.
    pub fn download_timeout(&self, piece_size: u64) -> Duration {
        cmp::max(
            self.min_download_timeout,
            Duration::from_secs(piece_size / self.min_bytes_per_second),
        )
    }

    pub async fn verify(&self, path: &str) -> Result<Report, SubsystemError> {
        let pointer = match self.metainfo.get(path).await {
            Ok(pointer) => pointer,
            Err(StorageError::NotFound(_)) => return Ok(Report::default()),
            Err(err) => return Err(err.into()),
        };

        let timeout = self.download_timeout(pointer.piece_size());
        let mut report = Report::default();

        for piece in pointer.pieces() {
            let node_id = piece.node_id;
            let record = match self.overlay.get(&node_id).await {
                Ok(record) => record,
                Err(StorageError::NotFound(_)) => {
                    report.fails.push(node_id);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if record.disqualified.is_some() {
                continue;
            }

            self.orders
                .create_order_limit(node_id, piece.piece_num, PieceAction::GetAudit, pointer.piece_size())
                .await?;

            match tokio::time::timeout(timeout, self.dialer.ping(&node_id, &record.address)).await {
                Ok(Ok(())) => report.successes.push(node_id),
                Ok(Err(err)) => {
                    debug!(subsystem = "audit:worker", node = %node_id, error = %err, "Node offline");
                    report.offlines.push(node_id);
                }
                Err(_) => {
                    let reverify_count = self
                        .containment
                        .get(&node_id)
                        .await?
                        .filter(|pending| pending.path == path && pending.piece_num == piece.piece_num)
                        .map_or(0, |pending| pending.reverify_count);
                    report.pending_audits.push(PendingAudit {
                        node_id,
                        path: path.to_string(),
                        piece_num: piece.piece_num,
                        reverify_count,
                    });
                }
            }
        }

        Ok(report)
    }
}
