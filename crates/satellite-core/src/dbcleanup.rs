//! Periodic removal of expired order serial numbers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared_types::Orders;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chore::Cycle;
use crate::container::config::DbCleanupConfig;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

pub struct Chore {
    orders: Arc<dyn Orders>,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Chore {
    pub fn new(orders: Arc<dyn Orders>, config: &DbCleanupConfig) -> Self {
        Self {
            orders,
            cycle: Cycle::new(config.serials_interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    pub async fn delete_expired_serials(&self) -> Result<usize, SubsystemError> {
        let deleted = self.orders.delete_expired_serials(Utc::now()).await?;
        if deleted > 0 {
            info!(subsystem = "dbcleanup", deleted, "Deleted expired serials");
        } else {
            debug!(subsystem = "dbcleanup", "No expired serials");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Subsystem for Chore {
    fn id(&self) -> SubsystemId {
        SubsystemId::DbCleanup
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        self.cycle
            .run(&token, move || async move { self.delete_expired_serials().await.map(drop) })
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
