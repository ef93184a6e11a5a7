//! Graceful exit chore.
//!
//! Storage nodes that announced their exit get a transfer queue listing
//! every piece they hold. The queue is built from one loop pass and written
//! in batches; a node is marked done only after the whole pass succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use shared_types::{GracefulExitDb, NodeId, Pointer, TransferQueueItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chore::Cycle;
use crate::container::config::GracefulExitConfig;
use crate::metainfo::{Loop, Observer};
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

struct PathCollector {
    exiting: HashSet<NodeId>,
    db: Arc<dyn GracefulExitDb>,
    batch_size: usize,
    buffer: Mutex<Vec<TransferQueueItem>>,
    total: Mutex<usize>,
}

impl PathCollector {
    async fn flush(&self) -> Result<(), SubsystemError> {
        let items = std::mem::take(&mut *self.buffer.lock());
        if items.is_empty() {
            return Ok(());
        }
        *self.total.lock() += items.len();
        self.db.enqueue(items).await?;
        Ok(())
    }
}

#[async_trait]
impl Observer for PathCollector {
    async fn remote_segment(&self, path: &str, pointer: &Pointer) -> Result<(), SubsystemError> {
        let full = {
            let mut buffer = self.buffer.lock();
            let now = Utc::now();
            buffer.extend(
                pointer
                    .pieces()
                    .iter()
                    .filter(|piece| self.exiting.contains(&piece.node_id))
                    .map(|piece| TransferQueueItem {
                        node_id: piece.node_id,
                        path: path.to_string(),
                        piece_num: piece.piece_num,
                        queued_at: now,
                    }),
            );
            buffer.len() >= self.batch_size
        };
        if full {
            self.flush().await?;
        }
        Ok(())
    }
}

pub struct Chore {
    db: Arc<dyn GracefulExitDb>,
    metainfo_loop: Arc<Loop>,
    batch_size: usize,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Chore {
    pub fn new(db: Arc<dyn GracefulExitDb>, metainfo_loop: Arc<Loop>, config: &GracefulExitConfig) -> Self {
        Self {
            db,
            metainfo_loop,
            batch_size: config.chore_batch_size.max(1),
            cycle: Cycle::new(config.chore_interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Build transfer queues for every exiting node still waiting for one.
    /// Returns the number of queued items.
    pub async fn build_queues(&self, token: &CancellationToken) -> Result<usize, SubsystemError> {
        let exiting: HashSet<NodeId> = self.db.nodes_awaiting_queue().await?.into_iter().collect();
        if exiting.is_empty() {
            debug!(subsystem = "gracefulexit", "No exiting nodes");
            return Ok(0);
        }

        let collector = Arc::new(PathCollector {
            exiting,
            db: Arc::clone(&self.db),
            batch_size: self.batch_size,
            buffer: Mutex::new(Vec::new()),
            total: Mutex::new(0),
        });
        self.metainfo_loop.join(token, collector.clone()).await?;
        collector.flush().await?;

        for id in &collector.exiting {
            self.db.mark_queue_built(id).await?;
        }

        let queued = *collector.total.lock();
        info!(subsystem = "gracefulexit", nodes = collector.exiting.len(), queued, "Transfer queues built");
        Ok(queued)
    }
}

#[async_trait]
impl Subsystem for Chore {
    fn id(&self) -> SubsystemId {
        SubsystemId::GracefulExit
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        let token = &token;
        self.cycle
            .run(token, move || async move { self.build_queues(token).await.map(drop) })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{remote_pointer, MemoryGracefulExit, MemoryPointerDb};
    use crate::container::config::MetainfoConfig;
    use shared_types::PointerDb;

    #[tokio::test]
    async fn test_queue_lists_pieces_of_exiting_nodes() {
        let db = Arc::new(MemoryPointerDb::default());
        db.put("p/b/a", remote_pointer("p", "b", &[1, 2])).await.unwrap();
        db.put("p/b/b", remote_pointer("p", "b", &[2, 3])).await.unwrap();
        db.put("p/b/c", remote_pointer("p", "b", &[3, 4])).await.unwrap();
        let metainfo_loop = Arc::new(Loop::new(
            db,
            MetainfoConfig {
                coalesce_duration_ms: 1,
                ..MetainfoConfig::default()
            },
        ));
        let token = CancellationToken::new();
        let runner = Arc::clone(&metainfo_loop);
        let run_token = token.clone();
        tokio::spawn(async move { runner.run(run_token).await });

        let exits = Arc::new(MemoryGracefulExit::default());
        exits.begin_exit(&NodeId([2; 32]), Utc::now()).await.unwrap();

        let config = GracefulExitConfig {
            chore_batch_size: 1,
            ..GracefulExitConfig::default()
        };
        let chore = Chore::new(exits.clone(), metainfo_loop, &config);

        assert_eq!(chore.build_queues(&token).await.unwrap(), 2);
        assert_eq!(exits.queue_len(&NodeId([2; 32])).await.unwrap(), 2);
        assert!(exits.nodes_awaiting_queue().await.unwrap().is_empty());

        // Nothing left to build.
        assert_eq!(chore.build_queues(&token).await.unwrap(), 0);
        token.cancel();
    }
}
