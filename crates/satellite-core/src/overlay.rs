//! # Overlay Service
//!
//! The satellite's view of storage nodes: address lookup, check-in results,
//! audit reputation and which nodes are currently reliable.
//!
//! ## Reliability
//!
//! A node is reliable when it is not disqualified and its last successful
//! contact falls inside `online_window`. Disqualification happens when the
//! audit success ratio drops below `audit_disqualify_ratio` after at least
//! `audit_min_count` audits.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{NodeAddress, NodeId, NodeRecord, OverlayCache, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::container::config::OverlayConfig;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

pub struct Service {
    cache: Arc<dyn OverlayCache>,
    config: OverlayConfig,
    closed: CancellationToken,
    lifecycle: Lifecycle,
}

impl Service {
    pub fn new(cache: Arc<dyn OverlayCache>, config: OverlayConfig) -> Self {
        Self {
            cache,
            config,
            closed: CancellationToken::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    pub async fn get(&self, id: &NodeId) -> Result<NodeRecord, StorageError> {
        self.cache.get(id).await
    }

    pub async fn all(&self) -> Result<Vec<NodeRecord>, StorageError> {
        self.cache.all().await
    }

    /// Record the outcome of contacting a node.
    pub async fn update_check_in(
        &self,
        id: &NodeId,
        address: NodeAddress,
        success: bool,
    ) -> Result<(), StorageError> {
        self.cache.update_check_in(id, address, success, Utc::now()).await
    }

    #[must_use]
    pub fn is_online(&self, record: &NodeRecord) -> bool {
        self.is_online_at(record, Utc::now())
    }

    fn is_online_at(&self, record: &NodeRecord, now: DateTime<Utc>) -> bool {
        let window = self.config.online_window();
        record.last_contact_success.is_some_and(|seen| {
            // A timestamp ahead of `now` (clock skew) counts as just seen.
            now.signed_duration_since(seen)
                .to_std()
                .map_or(true, |elapsed| elapsed <= window)
        })
    }

    /// IDs of nodes that are online and not disqualified.
    pub async fn reliable(&self) -> Result<HashSet<NodeId>, StorageError> {
        let now = Utc::now();
        Ok(self
            .cache
            .all()
            .await?
            .into_iter()
            .filter(|node| node.disqualified.is_none() && self.is_online_at(node, now))
            .map(|node| node.id)
            .collect())
    }

    /// Non-disqualified nodes not successfully contacted since `cutoff`.
    pub async fn offline_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>, StorageError> {
        Ok(self
            .cache
            .all()
            .await?
            .into_iter()
            .filter(|node| node.disqualified.is_none())
            .filter(|node| node.last_contact_success.map_or(true, |seen| seen < cutoff))
            .collect())
    }

    /// Record an audit outcome and disqualify the node if its reputation fell
    /// below the threshold.
    pub async fn update_stats(&self, id: &NodeId, audit_success: bool) -> Result<NodeRecord, StorageError> {
        let mut record = self.cache.update_audit_stats(id, audit_success).await?;

        let ratio = record.audit_success_ratio();
        if record.disqualified.is_none()
            && record.total_audit_count >= self.config.audit_min_count
            && ratio < self.config.audit_disqualify_ratio
        {
            let now = Utc::now();
            self.cache.disqualify(id, now).await?;
            record.disqualified = Some(now);
            warn!(subsystem = "overlay", node = %id, ratio, "Node disqualified");
        } else {
            debug!(subsystem = "overlay", node = %id, audit_success, ratio, "Audit stats updated");
        }

        Ok(record)
    }
}

#[async_trait]
impl Subsystem for Service {
    fn id(&self) -> SubsystemId {
        SubsystemId::OverlayService
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        tokio::select! {
            _ = token.cancelled() => Err(SubsystemError::Canceled),
            _ = self.closed.cancelled() => Ok(()),
        }
    }

    fn close(&self) -> Result<(), SubsystemError> {
        self.lifecycle.stop();
        self.closed.cancel();
        Ok(())
    }

    fn state(&self) -> SubsystemState {
        self.lifecycle.state()
    }
}
