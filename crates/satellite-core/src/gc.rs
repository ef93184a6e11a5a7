//! # Garbage Collection
//!
//! Every pass collects, for each storage node, the set of pieces it is
//! still expected to hold. The set is then delivered to the node, which may
//! delete any piece created before the pass started that is not in it.
//!
//! Disabled by configuration, `run` returns immediately.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use shared_types::{NodeId, OverlayCache, Pointer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chore::Cycle;
use crate::container::config::GarbageCollectionConfig;
use crate::metainfo::{Loop, Observer};
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};
use crate::rpc::Dialer;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceRef {
    pub path: String,
    pub piece_num: u16,
}

/// Pieces one node must keep.
#[derive(Debug, Clone)]
pub struct RetainSet {
    /// Pieces created at or after this instant are never collected.
    pub created_before: DateTime<Utc>,
    pub pieces: HashSet<PieceRef>,
}

impl RetainSet {
    fn new(created_before: DateTime<Utc>) -> Self {
        Self {
            created_before,
            pieces: HashSet::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, path: &str, piece_num: u16) -> bool {
        self.pieces.contains(&PieceRef {
            path: path.to_string(),
            piece_num,
        })
    }
}

struct RetainObserver {
    started: DateTime<Utc>,
    sets: Mutex<HashMap<NodeId, RetainSet>>,
}

#[async_trait]
impl Observer for RetainObserver {
    async fn remote_segment(&self, path: &str, pointer: &Pointer) -> Result<(), SubsystemError> {
        let mut sets = self.sets.lock();
        for piece in pointer.pieces() {
            sets.entry(piece.node_id)
                .or_insert_with(|| RetainSet::new(self.started))
                .pieces
                .insert(PieceRef {
                    path: path.to_string(),
                    piece_num: piece.piece_num,
                });
        }
        Ok(())
    }
}

pub struct Service {
    enabled: bool,
    skip_first: AtomicBool,
    concurrent_sends: usize,
    dialer: Dialer,
    overlay: Arc<dyn OverlayCache>,
    metainfo_loop: Arc<Loop>,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Service {
    pub fn new(
        config: &GarbageCollectionConfig,
        dialer: Dialer,
        overlay: Arc<dyn OverlayCache>,
        metainfo_loop: Arc<Loop>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            skip_first: AtomicBool::new(config.skip_first),
            concurrent_sends: config.concurrent_sends.max(1),
            dialer,
            overlay,
            metainfo_loop,
            cycle: Cycle::new(config.interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Build the retain set of every node holding at least one piece.
    pub async fn collect(&self, token: &CancellationToken) -> Result<HashMap<NodeId, RetainSet>, SubsystemError> {
        let observer = Arc::new(RetainObserver {
            started: Utc::now(),
            sets: Mutex::new(HashMap::new()),
        });
        self.metainfo_loop.join(token, observer.clone()).await?;
        let sets = std::mem::take(&mut *observer.sets.lock());
        Ok(sets)
    }

    /// Deliver retain sets to their nodes. Returns how many nodes were reached.
    pub async fn send(&self, sets: HashMap<NodeId, RetainSet>) -> usize {
        futures::stream::iter(sets)
            .map(|(node_id, retain)| self.send_one(node_id, retain))
            .buffer_unordered(self.concurrent_sends)
            .filter(|sent| futures::future::ready(*sent))
            .count()
            .await
    }

    async fn send_one(&self, node_id: NodeId, retain: RetainSet) -> bool {
        let record = match self.overlay.get(&node_id).await {
            Ok(record) if record.disqualified.is_none() => record,
            Ok(_) => return false,
            Err(err) => {
                debug!(subsystem = "garbage-collection", node = %node_id, error = %err, "Node lookup failed");
                return false;
            }
        };
        match self.dialer.ping(&node_id, &record.address).await {
            Ok(()) => {
                debug!(
                    subsystem = "garbage-collection",
                    node = %node_id,
                    pieces = retain.pieces.len(),
                    "Retain set sent"
                );
                true
            }
            Err(err) => {
                warn!(subsystem = "garbage-collection", node = %node_id, error = %err, "Retain send failed");
                false
            }
        }
    }

    async fn pass(&self, token: &CancellationToken) -> Result<(), SubsystemError> {
        if self.skip_first.swap(false, Ordering::SeqCst) {
            debug!(subsystem = "garbage-collection", "Skipping first pass");
            return Ok(());
        }
        let sets = self.collect(token).await?;
        let nodes = sets.len();
        let reached = self.send(sets).await;
        info!(subsystem = "garbage-collection", nodes, reached, "Retain sets delivered");
        Ok(())
    }
}

#[async_trait]
impl Subsystem for Service {
    fn id(&self) -> SubsystemId {
        SubsystemId::GarbageCollection
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        if !self.enabled {
            debug!(subsystem = "garbage-collection", "Disabled");
            return Ok(());
        }
        let token = &token;
        self.cycle.run(token, move || self.pass(token)).await
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
    use crate::adapters::memory::{remote_pointer, MemoryOverlayCache, MemoryPointerDb, MemoryRevocationDb};
    use crate::container::config::{MetainfoConfig, ServerConfig};
    use crate::rpc::Options;
    use shared_types::{FullIdentity, NodeAddress, NodeRecord, PointerDb};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn dialer() -> Dialer {
        let identity = FullIdentity::from_seed([40; 32]);
        let options = Options::new(&identity, &ServerConfig::default(), Arc::new(MemoryRevocationDb::default())).unwrap();
        Dialer::new(Arc::new(options), Duration::from_secs(1))
    }

    async fn segments() -> Arc<Loop> {
        let db = Arc::new(MemoryPointerDb::default());
        db.put("p/b/a", remote_pointer("p", "b", &[1, 2])).await.unwrap();
        db.put("p/b/b", remote_pointer("p", "b", &[2, 3])).await.unwrap();
        Arc::new(Loop::new(
            db,
            MetainfoConfig {
                coalesce_duration_ms: 1,
                ..MetainfoConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_disabled_returns_immediately() {
        let config = GarbageCollectionConfig {
            enabled: false,
            ..GarbageCollectionConfig::default()
        };
        let service = Service::new(&config, dialer(), Arc::new(MemoryOverlayCache::default()), segments().await);
        service.run(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_retain_sets_cover_every_piece() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = NodeAddress::tcp(listener.local_addr().unwrap().to_string());
        let cache = Arc::new(MemoryOverlayCache::default());
        cache.upsert(NodeRecord::new(NodeId([2; 32]), address)).await.unwrap();

        let metainfo_loop = segments().await;
        let token = CancellationToken::new();
        let runner = Arc::clone(&metainfo_loop);
        let run_token = token.clone();
        tokio::spawn(async move { runner.run(run_token).await });

        let service = Service::new(&GarbageCollectionConfig::default(), dialer(), cache, metainfo_loop);
        let sets = service.collect(&token).await.unwrap();

        assert_eq!(sets.len(), 3);
        let shared = &sets[&NodeId([2; 32])];
        assert!(shared.contains("p/b/a", 1));
        assert!(shared.contains("p/b/b", 0));
        assert!(!shared.contains("p/b/a", 0));

        // Only node 2 is known to the overlay and reachable.
        assert_eq!(service.send(sets).await, 1);
        token.cancel();
    }
}
