//! Audit worker: drains the audit queue, verifying and reporting each path.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Queue, Reporter, Verifier};
use crate::chore::Cycle;
use crate::container::config::AuditConfig;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

pub struct Worker {
    queue: Arc<Queue>,
    verifier: Verifier,
    reporter: Reporter,
    concurrency: usize,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Worker {
    pub fn new(
        queue: Arc<Queue>,
        verifier: Verifier,
        reporter: Reporter,
        config: &AuditConfig,
    ) -> Result<Self, SubsystemError> {
        if config.worker_concurrency == 0 {
            return Err(SubsystemError::Config(
                "audit.worker_concurrency must be at least 1".into(),
            ));
        }
        Ok(Self {
            queue,
            verifier,
            reporter,
            concurrency: config.worker_concurrency,
            cycle: Cycle::new(config.queue_interval()),
            lifecycle: Lifecycle::new(),
        })
    }

    /// Audit every path currently in the queue. Returns how many were audited.
    pub async fn process(&self) -> Result<usize, SubsystemError> {
        let paths: Vec<String> = std::iter::from_fn(|| self.queue.next()).collect();
        if paths.is_empty() {
            return Ok(0);
        }

        let audited = paths.len();
        futures::stream::iter(paths)
            .for_each_concurrent(self.concurrency, |path| self.audit(path))
            .await;

        info!(subsystem = "audit:worker", audited, "Audit batch complete");
        Ok(audited)
    }

    async fn audit(&self, path: String) {
        let report = match self.verifier.verify(&path).await {
            Ok(report) => report,
            Err(err) => {
                warn!(subsystem = "audit:worker", path = %path, error = %err, "Verification failed");
                return;
            }
        };
        if report.is_empty() {
            debug!(subsystem = "audit:worker", path = %path, "Nothing to report");
            return;
        }
        self.reporter.record_audits(report).await;
    }
}

#[async_trait]
impl Subsystem for Worker {
    fn id(&self) -> SubsystemId {
        SubsystemId::AuditWorker
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        self.cycle
            .run(&token, move || async move { self.process().await.map(drop) })
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
    use crate::adapters::memory::{
        remote_pointer, MemoryBuckets, MemoryContainment, MemoryOrders, MemoryOverlayCache, MemoryPointerDb,
        MemoryRevocationDb,
    };
    use crate::container::config::{OrdersConfig, OverlayConfig, ServerConfig};
    use crate::rpc::{Dialer, Options};
    use crate::{metainfo, orders, overlay};
    use shared_types::{FullIdentity, NodeAddress, NodeId, NodeRecord, OverlayCache, PointerDb};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn worker(config: &AuditConfig) -> (Result<Worker, SubsystemError>, Arc<Queue>, Arc<MemoryOverlayCache>, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = NodeAddress::tcp(listener.local_addr().unwrap().to_string());

        let cache = Arc::new(MemoryOverlayCache::default());
        for seed in [1u8, 2] {
            cache.upsert(NodeRecord::new(NodeId([seed; 32]), address.clone())).await.unwrap();
        }
        let db = Arc::new(MemoryPointerDb::default());
        db.put("p/b/s", remote_pointer("p", "b", &[1, 2])).await.unwrap();

        let identity = Arc::new(FullIdentity::from_seed([30; 32]));
        let options = Options::new(&identity, &ServerConfig::default(), Arc::new(MemoryRevocationDb::default())).unwrap();
        let overlay = Arc::new(overlay::Service::new(cache.clone(), OverlayConfig::default()));
        let containment = Arc::new(MemoryContainment::default());

        let verifier = Verifier::new(
            Arc::new(metainfo::Service::new(db, Arc::new(MemoryBuckets::default()))),
            Arc::new(orders::Service::new(identity, Arc::new(MemoryOrders::default()), &OrdersConfig::default())),
            overlay.clone(),
            containment.clone(),
            Dialer::new(Arc::new(options), Duration::from_secs(1)),
            config,
        );
        let reporter = Reporter::new(overlay, containment, config);
        let queue = Arc::new(Queue::new());
        (Worker::new(queue.clone(), verifier, reporter, config), queue, cache, listener)
    }

    #[tokio::test]
    async fn test_worker_audits_queued_paths() {
        let (worker, queue, cache, _listener) = worker(&AuditConfig::default()).await;
        let worker = worker.unwrap();
        queue.swap(vec!["p/b/s".into(), "p/b/gone".into()]);

        assert_eq!(worker.process().await.unwrap(), 2);
        assert!(queue.is_empty());
        for seed in [1u8, 2] {
            let record = cache.get(&NodeId([seed; 32])).await.unwrap();
            assert_eq!(record.audit_success_count, 1);
        }
        assert_eq!(worker.process().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let config = AuditConfig {
            worker_concurrency: 0,
            ..AuditConfig::default()
        };
        let (worker, ..) = worker(&config).await;
        assert!(matches!(worker, Err(SubsystemError::Config(_))));
    }
}
