//! Daily rollup of storage node tallies.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use shared_types::{NodeId, NodeRollup, StoragenodeAccounting};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chore::Cycle;
use crate::container::config::RollupConfig;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

pub struct Rollup {
    nodes: Arc<dyn StoragenodeAccounting>,
    delete_tallies: bool,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Rollup {
    pub fn new(nodes: Arc<dyn StoragenodeAccounting>, config: &RollupConfig) -> Self {
        Self {
            nodes,
            delete_tallies: config.delete_tallies,
            cycle: Cycle::new(config.interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Aggregate every tally since the last rollup; returns the rollups written.
    pub async fn rollup(&self) -> Result<usize, SubsystemError> {
        let last = self.nodes.last_rollup().await?;
        let tallies = self.nodes.tallies_since(last).await?;

        let Some(latest) = tallies.iter().map(|t| t.interval_end).max() else {
            debug!(subsystem = "rollup", "No new tallies");
            return Ok(0);
        };

        let mut days: BTreeMap<(NodeId, NaiveDate), NodeRollup> = BTreeMap::new();
        for tally in &tallies {
            let day = tally.interval_end.date_naive();
            let rollup = days.entry((tally.node_id, day)).or_insert_with(|| NodeRollup {
                node_id: tally.node_id,
                day,
                at_rest_byte_samples: 0,
                samples: 0,
            });
            rollup.at_rest_byte_samples += tally.at_rest_bytes;
            rollup.samples += 1;
        }

        let rollups: Vec<NodeRollup> = days.into_values().collect();
        let written = rollups.len();
        self.nodes.save_rollups(latest, rollups).await?;

        if self.delete_tallies {
            let deleted = self.nodes.delete_tallies_before(latest).await?;
            debug!(subsystem = "rollup", deleted, "Deleted rolled up tallies");
        }

        info!(subsystem = "rollup", rollups = written, latest = %latest, "Rollup saved");
        Ok(written)
    }
}

#[async_trait]
impl Subsystem for Rollup {
    fn id(&self) -> SubsystemId {
        SubsystemId::Rollup
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        self.cycle
            .run(&token, move || async move { self.rollup().await.map(drop) })
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
