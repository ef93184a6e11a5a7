//! # Downtime Tracking
//!
//! The detection chore looks for nodes that have not been contacted
//! successfully within one detection interval, dials each of them once and
//! records the time since their last contact as downtime when the dial
//! fails. It does not join the metainfo loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{DowntimeTracking, NodeRecord};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chore::Cycle;
use crate::container::config::DowntimeConfig;
use crate::contact;
use crate::overlay;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

pub struct Service {
    overlay: Arc<overlay::Service>,
    contact: Arc<contact::Service>,
}

impl Service {
    pub fn new(overlay: Arc<overlay::Service>, contact: Arc<contact::Service>) -> Self {
        Self { overlay, contact }
    }

    /// Dial `node` and record the result. True when it answered.
    pub async fn check_and_update_availability(&self, node: &NodeRecord) -> Result<bool, SubsystemError> {
        let online = match self.contact.ping_node(&node.id, &node.address).await {
            Ok(()) => true,
            Err(err) => {
                debug!(subsystem = "downtime", node = %node.id, error = %err, "Node unreachable");
                false
            }
        };
        self.overlay
            .update_check_in(&node.id, node.address.clone(), online)
            .await?;
        Ok(online)
    }
}

pub struct DetectionChore {
    service: Arc<Service>,
    overlay: Arc<overlay::Service>,
    downtime: Arc<dyn DowntimeTracking>,
    interval: Duration,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl DetectionChore {
    pub fn new(
        config: &DowntimeConfig,
        service: Arc<Service>,
        overlay: Arc<overlay::Service>,
        downtime: Arc<dyn DowntimeTracking>,
    ) -> Self {
        Self {
            service,
            overlay,
            downtime,
            interval: config.detection_interval(),
            cycle: Cycle::new(config.detection_interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Returns the number of nodes whose downtime grew.
    pub async fn detect(&self) -> Result<usize, SubsystemError> {
        let now = Utc::now();
        let interval = chrono::Duration::from_std(self.interval)
            .map_err(|e| SubsystemError::Config(format!("downtime.detection_interval_secs: {e}")))?;
        let cutoff = now - interval;

        let mut offline = 0;
        for node in self.overlay.offline_since(cutoff).await? {
            if self.service.check_and_update_availability(&node).await? {
                continue;
            }
            // Count from the most recent contact attempt, never further back than one interval.
            let since = [node.last_contact_success, node.last_contact_failure]
                .into_iter()
                .flatten()
                .max()
                .map_or(cutoff, |last| last.max(cutoff));
            let seconds = (now - since).num_seconds().max(0);
            self.downtime.add(&node.id, now, seconds).await?;
            offline += 1;
        }

        if offline > 0 {
            info!(subsystem = "downtime:detection", offline, "Downtime recorded");
        }
        Ok(offline)
    }
}

#[async_trait]
impl Subsystem for DetectionChore {
    fn id(&self) -> SubsystemId {
        SubsystemId::DowntimeDetection
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        self.cycle
            .run(&token, move || async move { self.detect().await.map(drop) })
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
