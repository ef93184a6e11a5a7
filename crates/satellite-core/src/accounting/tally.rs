//! Storage tally.
//!
//! Each cycle joins the metainfo loop, sums bytes per bucket and per storage
//! node, saves both and then resets the live usage counters that the saved
//! totals now cover.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared_types::{LiveAccounting, NodeId, NodeTally, Pointer, ProjectAccounting, ProjectTally, StoragenodeAccounting};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chore::Cycle;
use crate::container::config::TallyConfig;
use crate::metainfo::{Loop, Observer};
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

/// Totals gathered during one pass.
#[derive(Default)]
pub struct TallyObserver {
    buckets: Mutex<BTreeMap<(String, String), ProjectTally>>,
    nodes: Mutex<HashMap<NodeId, u64>>,
}

impl TallyObserver {
    fn bucket<F: FnOnce(&mut ProjectTally)>(&self, pointer: &Pointer, update: F) {
        let mut buckets = self.buckets.lock();
        let tally = buckets
            .entry((pointer.project_id.clone(), pointer.bucket.clone()))
            .or_insert_with(|| ProjectTally {
                project_id: pointer.project_id.clone(),
                bucket: pointer.bucket.clone(),
                ..ProjectTally::default()
            });
        update(tally);
    }

    pub fn project_tallies(&self) -> Vec<ProjectTally> {
        self.buckets.lock().values().cloned().collect()
    }

    pub fn node_tallies(&self, interval_end: DateTime<Utc>) -> Vec<NodeTally> {
        let mut tallies: Vec<NodeTally> = self
            .nodes
            .lock()
            .iter()
            .map(|(node_id, bytes)| NodeTally {
                node_id: *node_id,
                at_rest_bytes: *bytes,
                interval_end,
            })
            .collect();
        tallies.sort_by_key(|t| t.node_id);
        tallies
    }
}

#[async_trait]
impl Observer for TallyObserver {
    async fn remote_segment(&self, _path: &str, pointer: &Pointer) -> Result<(), SubsystemError> {
        self.bucket(pointer, |tally| {
            tally.remote_bytes += pointer.segment_size;
            tally.segments += 1;
        });

        let piece_size = pointer.piece_size();
        let mut nodes = self.nodes.lock();
        for piece in pointer.pieces() {
            *nodes.entry(piece.node_id).or_default() += piece_size;
        }
        Ok(())
    }

    async fn inline_segment(&self, _path: &str, pointer: &Pointer) -> Result<(), SubsystemError> {
        self.bucket(pointer, |tally| {
            tally.inline_bytes += pointer.segment_size;
            tally.segments += 1;
        });
        Ok(())
    }
}

pub struct Tally {
    metainfo_loop: Arc<Loop>,
    live: Arc<dyn LiveAccounting>,
    projects: Arc<dyn ProjectAccounting>,
    nodes: Arc<dyn StoragenodeAccounting>,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Tally {
    pub fn new(
        metainfo_loop: Arc<Loop>,
        live: Arc<dyn LiveAccounting>,
        projects: Arc<dyn ProjectAccounting>,
        nodes: Arc<dyn StoragenodeAccounting>,
        config: &TallyConfig,
    ) -> Self {
        Self {
            metainfo_loop,
            live,
            projects,
            nodes,
            cycle: Cycle::new(config.interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Run one tally pass.
    pub async fn tally(&self, token: &CancellationToken) -> Result<(), SubsystemError> {
        let observer = Arc::new(TallyObserver::default());
        self.metainfo_loop.join(token, observer.clone()).await?;

        let now = Utc::now();
        let projects = observer.project_tallies();
        let nodes = observer.node_tallies(now);
        let (project_count, node_count) = (projects.len(), nodes.len());

        self.projects.save_tallies(now, projects).await?;
        self.nodes.save_tallies(nodes).await?;
        self.live.reset_totals().await?;

        info!(subsystem = "tally", buckets = project_count, nodes = node_count, "Tally saved");
        Ok(())
    }
}

#[async_trait]
impl Subsystem for Tally {
    fn id(&self) -> SubsystemId {
        SubsystemId::Tally
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        let token = &token;
        self.cycle.run(token, move || self.tally(token)).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{
        inline_pointer, remote_pointer, MemoryLiveAccounting, MemoryPointerDb, MemoryProjectAccounting,
        MemoryStoragenodeAccounting,
    };
    use crate::container::config::MetainfoConfig;
    use shared_types::PointerDb;

    #[tokio::test]
    async fn test_observer_sums_buckets_and_nodes() {
        let observer = TallyObserver::default();
        let a = remote_pointer("p", "b", &[1, 2]);
        let b = remote_pointer("p", "b", &[2, 3]);
        observer.remote_segment("p/b/0", &a).await.unwrap();
        observer.remote_segment("p/b/1", &b).await.unwrap();
        observer
            .inline_segment("p/b/2", &inline_pointer("p", "b", b"abc"))
            .await
            .unwrap();

        let projects = observer.project_tallies();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].remote_bytes, 2048);
        assert_eq!(projects[0].inline_bytes, 3);
        assert_eq!(projects[0].segments, 3);

        let nodes = observer.node_tallies(Utc::now());
        let node2 = nodes.iter().find(|t| t.node_id == NodeId([2; 32])).unwrap();
        assert_eq!(node2.at_rest_bytes, 1024);
        assert_eq!(nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_tally_saves_and_resets_live_usage() {
        let db = Arc::new(MemoryPointerDb::default());
        db.put("p/b/0", remote_pointer("p", "b", &[1, 2])).await.unwrap();
        let metainfo_loop = Arc::new(Loop::new(
            db,
            MetainfoConfig {
                coalesce_duration_ms: 1,
                ..MetainfoConfig::default()
            },
        ));
        let live = Arc::new(MemoryLiveAccounting::default());
        live.add_project_storage_usage("p", 0, 99).await.unwrap();
        let projects = Arc::new(MemoryProjectAccounting::default());
        let nodes = Arc::new(MemoryStoragenodeAccounting::default());

        let tally = Tally::new(
            metainfo_loop.clone(),
            live.clone(),
            projects.clone(),
            nodes.clone(),
            &TallyConfig::default(),
        );

        let token = CancellationToken::new();
        let runner = metainfo_loop.clone();
        let run_token = token.clone();
        tokio::spawn(async move { runner.run(run_token).await });

        tally.tally(&token).await.unwrap();
        token.cancel();

        assert_eq!(projects.project_storage_total("p").await.unwrap(), 1024);
        assert_eq!(projects.save_count(), 1);
        assert_eq!(nodes.tally_count(), 2);
        assert_eq!(live.project_storage_usage("p").await.unwrap(), 0);
    }
}
