//! Audit chore: samples segments from a loop pass and refills the queue.
//!
//! Each node keeps a reservoir of at most `slots` segment paths, so nodes
//! holding many segments are not audited more often than nodes holding few.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use shared_types::{NodeId, Pointer};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Queue;
use crate::chore::Cycle;
use crate::container::config::AuditConfig;
use crate::metainfo::{Loop, Observer};
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

#[derive(Debug)]
struct Reservoir {
    paths: Vec<String>,
    seen: u64,
}

impl Reservoir {
    fn new(slots: usize) -> Self {
        Self {
            paths: Vec::with_capacity(slots),
            seen: 0,
        }
    }

    fn sample<R: Rng>(&mut self, rng: &mut R, slots: usize, path: &str) {
        self.seen += 1;
        if self.paths.len() < slots {
            self.paths.push(path.to_string());
            return;
        }
        let pick = rng.gen_range(0..self.seen);
        if let Ok(index) = usize::try_from(pick) {
            if index < slots {
                self.paths[index] = path.to_string();
            }
        }
    }
}

struct SampleObserver {
    slots: usize,
    reservoirs: Mutex<HashMap<NodeId, Reservoir>>,
}

impl SampleObserver {
    fn new(slots: usize) -> Self {
        Self {
            slots,
            reservoirs: Mutex::new(HashMap::new()),
        }
    }

    fn sample(&self, path: &str, pointer: &Pointer) {
        let mut rng = rand::thread_rng();
        let mut reservoirs = self.reservoirs.lock();
        for piece in pointer.pieces() {
            reservoirs
                .entry(piece.node_id)
                .or_insert_with(|| Reservoir::new(self.slots))
                .sample(&mut rng, self.slots, path);
        }
    }

    /// Unique sampled paths in random order. Leaves the observer empty.
    fn take_paths(&self) -> Vec<String> {
        let reservoirs = std::mem::take(&mut *self.reservoirs.lock());
        let mut unique = HashSet::new();
        let mut paths: Vec<String> = reservoirs
            .into_values()
            .flat_map(|reservoir| reservoir.paths)
            .filter(|path| unique.insert(path.clone()))
            .collect();
        paths.shuffle(&mut rand::thread_rng());
        paths
    }
}

#[async_trait]
impl Observer for SampleObserver {
    async fn remote_segment(&self, path: &str, pointer: &Pointer) -> Result<(), SubsystemError> {
        self.sample(path, pointer);
        Ok(())
    }
}

pub struct Chore {
    queue: Arc<Queue>,
    metainfo_loop: Arc<Loop>,
    slots: usize,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Chore {
    pub fn new(queue: Arc<Queue>, metainfo_loop: Arc<Loop>, config: &AuditConfig) -> Self {
        Self {
            queue,
            metainfo_loop,
            slots: config.slots.max(1),
            cycle: Cycle::new(config.chore_interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Sample one pass and replace the queue contents. Returns the queue size.
    pub async fn refill(&self, token: &CancellationToken) -> Result<usize, SubsystemError> {
        let observer = Arc::new(SampleObserver::new(self.slots));
        self.metainfo_loop.join(token, observer.clone()).await?;

        let paths = observer.take_paths();

        let queued = paths.len();
        self.queue.swap(paths);
        info!(subsystem = "audit:chore", queued, "Audit queue refilled");
        Ok(queued)
    }
}

#[async_trait]
impl Subsystem for Chore {
    fn id(&self) -> SubsystemId {
        SubsystemId::AuditChore
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        let token = &token;
        self.cycle
            .run(token, move || async move { self.refill(token).await.map(drop) })
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
