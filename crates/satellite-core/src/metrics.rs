//! Metrics chore: counts segments by kind on every loop pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use satellite_telemetry::Monitor;
use shared_types::Pointer;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chore::Cycle;
use crate::container::config::MetricsConfig;
use crate::metainfo::{Loop, Observer};
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

/// Segment counts of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentCounts {
    pub remote: u64,
    pub inline: u64,
}

#[derive(Default)]
struct Counter {
    remote: AtomicU64,
    inline: AtomicU64,
}

#[async_trait]
impl Observer for Counter {
    async fn remote_segment(&self, _path: &str, _pointer: &Pointer) -> Result<(), SubsystemError> {
        self.remote.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn inline_segment(&self, _path: &str, _pointer: &Pointer) -> Result<(), SubsystemError> {
        self.inline.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct Chore {
    monitor: Monitor,
    metainfo_loop: Arc<Loop>,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Chore {
    pub fn new(monitor: Monitor, metainfo_loop: Arc<Loop>, config: &MetricsConfig) -> Self {
        Self {
            monitor,
            metainfo_loop,
            cycle: Cycle::new(config.chore_interval()),
            lifecycle: Lifecycle::new(),
        }
    }

    pub async fn count(&self, token: &CancellationToken) -> Result<SegmentCounts, SubsystemError> {
        let counter = Arc::new(Counter::default());
        self.metainfo_loop.join(token, counter.clone()).await?;

        let counts = SegmentCounts {
            remote: counter.remote.load(Ordering::Relaxed),
            inline: counter.inline.load(Ordering::Relaxed),
        };
        self.monitor.set_segment_count("remote", counts.remote);
        self.monitor.set_segment_count("inline", counts.inline);
        debug!(subsystem = "metrics", remote = counts.remote, inline = counts.inline, "Segments counted");
        Ok(counts)
    }
}

#[async_trait]
impl Subsystem for Chore {
    fn id(&self) -> SubsystemId {
        SubsystemId::Metrics
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        let token = &token;
        self.cycle
            .run(token, move || async move { self.count(token).await.map(drop) })
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
    use crate::adapters::memory::{inline_pointer, remote_pointer, MemoryPointerDb};
    use crate::container::config::MetainfoConfig;
    use shared_types::PointerDb;

    #[tokio::test]
    async fn test_counts_land_in_monitor() {
        let db = Arc::new(MemoryPointerDb::default());
        db.put("p/b/r0", remote_pointer("p", "b", &[1])).await.unwrap();
        db.put("p/b/r1", remote_pointer("p", "b", &[2])).await.unwrap();
        db.put("p/b/i0", inline_pointer("p", "b", b"abc")).await.unwrap();
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

        let monitor = Monitor::new().unwrap();
        let chore = Chore::new(monitor.clone(), metainfo_loop, &MetricsConfig::default());

        let counts = chore.count(&token).await.unwrap();
        assert_eq!(counts, SegmentCounts { remote: 2, inline: 1 });
        assert_eq!(monitor.segment_count("remote"), 2);
        assert_eq!(monitor.segment_count("inline"), 1);
        token.cancel();
    }
}
