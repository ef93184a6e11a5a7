//! # Metainfo Loop
//!
//! One pass over every segment, shared by all observers that joined before
//! the pass started.
//!
//! ```text
//!   join(observer) ──→ [join queue] ──→ run: wait for first observer
//!                                           │
//!                                           ├─ coalesce: collect more joins
//!                                           │
//!                                           └─ pass: every segment → every observer
//!                                                  │
//!   join returns  ←──────────── done ──────────────┘
//! ```
//!
//! An observer that fails is dropped from the pass and its `join` returns the
//! error; the other observers continue. Closing the loop fails every pending
//! join with `LoopError::Closed`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{Pointer, PointerDb, SegmentData, StorageError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::container::config::MetainfoConfig;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

#[derive(Debug, Clone, Error)]
pub enum LoopError {
    #[error("loop closed")]
    Closed,

    #[error("context canceled")]
    Canceled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("observer failed: {0}")]
    Observer(String),
}

impl From<LoopError> for SubsystemError {
    fn from(err: LoopError) -> Self {
        match err {
            LoopError::Canceled => SubsystemError::Canceled,
            LoopError::Storage(e) => SubsystemError::Storage(e),
            other => SubsystemError::Loop(other.to_string()),
        }
    }
}

/// Receives every segment of a pass.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn remote_segment(&self, path: &str, pointer: &Pointer) -> Result<(), SubsystemError>;

    async fn inline_segment(&self, _path: &str, _pointer: &Pointer) -> Result<(), SubsystemError> {
        Ok(())
    }
}

struct Joined {
    observer: Arc<dyn Observer>,
    done: oneshot::Sender<Result<(), LoopError>>,
}

impl Joined {
    fn finish(self, result: Result<(), LoopError>) {
        // The joiner may have given up already.
        let _ = self.done.send(result);
    }
}

pub struct Loop {
    db: Arc<dyn PointerDb>,
    config: MetainfoConfig,
    join_tx: mpsc::UnboundedSender<Joined>,
    join_rx: Mutex<Option<mpsc::UnboundedReceiver<Joined>>>,
    closed: CancellationToken,
    lifecycle: Lifecycle,
}

impl Loop {
    pub fn new(db: Arc<dyn PointerDb>, config: MetainfoConfig) -> Self {
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        Self {
            db,
            config,
            join_tx,
            join_rx: Mutex::new(Some(join_rx)),
            closed: CancellationToken::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Wait for the next pass to deliver every segment to `observer`.
    pub async fn join(&self, token: &CancellationToken, observer: Arc<dyn Observer>) -> Result<(), LoopError> {
        if self.closed.is_cancelled() {
            return Err(LoopError::Closed);
        }

        let (done, finished) = oneshot::channel();
        self.join_tx
            .send(Joined { observer, done })
            .map_err(|_| LoopError::Closed)?;

        tokio::select! {
            _ = token.cancelled() => Err(LoopError::Canceled),
            _ = self.closed.cancelled() => Err(LoopError::Closed),
            result = finished => result.unwrap_or(Err(LoopError::Closed)),
        }
    }

    async fn next_batch(
        &self,
        token: &CancellationToken,
        joins: &mut mpsc::UnboundedReceiver<Joined>,
    ) -> Result<Option<Vec<Joined>>, SubsystemError> {
        let first = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SubsystemError::Canceled),
            _ = self.closed.cancelled() => return Ok(None),
            joined = joins.recv() => match joined {
                Some(joined) => joined,
                None => return Ok(None),
            },
        };

        let mut batch = vec![first];
        let coalesce = tokio::time::sleep(self.config.coalesce_duration());
        tokio::pin!(coalesce);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    batch.into_iter().for_each(|j| j.finish(Err(LoopError::Canceled)));
                    return Err(SubsystemError::Canceled);
                }
                _ = self.closed.cancelled() => {
                    batch.into_iter().for_each(|j| j.finish(Err(LoopError::Closed)));
                    return Ok(None);
                }
                _ = &mut coalesce => break,
                joined = joins.recv() => match joined {
                    Some(joined) => batch.push(joined),
                    None => break,
                },
            }
        }

        Ok(Some(batch))
    }

    async fn pass(&self, token: &CancellationToken, mut observers: Vec<Joined>) -> Result<(), SubsystemError> {
        let segments = match self.db.list().await {
            Ok(segments) => segments,
            Err(err) => {
                observers
                    .into_iter()
                    .for_each(|j| j.finish(Err(LoopError::Storage(err.clone()))));
                return Err(err.into());
            }
        };

        debug!(
            subsystem = "metainfo:loop",
            observers = observers.len(),
            segments = segments.len(),
            "Starting pass"
        );

        for (path, pointer) in &segments {
            if token.is_cancelled() {
                observers.into_iter().for_each(|j| j.finish(Err(LoopError::Canceled)));
                return Err(SubsystemError::Canceled);
            }
            if self.closed.is_cancelled() {
                observers.into_iter().for_each(|j| j.finish(Err(LoopError::Closed)));
                return Ok(());
            }

            let mut remaining = Vec::with_capacity(observers.len());
            for joined in observers {
                let result = match pointer.data {
                    SegmentData::Remote { .. } => joined.observer.remote_segment(path, pointer).await,
                    SegmentData::Inline(_) => joined.observer.inline_segment(path, pointer).await,
                };
                match result {
                    Ok(()) => remaining.push(joined),
                    Err(err) => joined.finish(Err(LoopError::Observer(err.to_string()))),
                }
            }
            observers = remaining;
        }

        let finished = observers.len();
        observers.into_iter().for_each(|j| j.finish(Ok(())));
        info!(subsystem = "metainfo:loop", observers = finished, "Pass complete");
        Ok(())
    }
}

#[async_trait]
impl Subsystem for Loop {
    fn id(&self) -> SubsystemId {
        SubsystemId::MetainfoLoop
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        let mut joins = self
            .join_rx
            .lock()
            .take()
            .ok_or_else(|| SubsystemError::Failed("metainfo loop is already running".into()))?;

        while let Some(batch) = self.next_batch(&token, &mut joins).await? {
            self.pass(&token, batch).await?;
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{inline_pointer, remote_pointer, MemoryPointerDb};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        remote: AtomicUsize,
        inline: AtomicUsize,
    }

    #[async_trait]
    impl Observer for Counter {
        async fn remote_segment(&self, _: &str, _: &Pointer) -> Result<(), SubsystemError> {
            self.remote.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn inline_segment(&self, _: &str, _: &Pointer) -> Result<(), SubsystemError> {
            self.inline.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Observer for Failing {
        async fn remote_segment(&self, _: &str, _: &Pointer) -> Result<(), SubsystemError> {
            Err(SubsystemError::Failed("observer broke".into()))
        }
    }

    async fn loop_with_segments() -> Arc<Loop> {
        let db = Arc::new(MemoryPointerDb::default());
        db.put("p/b/s0", remote_pointer("p", "b", &[1, 2, 3])).await.unwrap();
        db.put("p/b/s1", remote_pointer("p", "b", &[4, 5, 6])).await.unwrap();
        db.put("p/b/l", inline_pointer("p", "b", b"tiny")).await.unwrap();
        let config = MetainfoConfig {
            coalesce_duration_ms: 10,
            ..MetainfoConfig::default()
        };
        Arc::new(Loop::new(db, config))
    }

    #[tokio::test]
    async fn test_joined_observers_share_one_pass() {
        let segments = loop_with_segments().await;
        let token = CancellationToken::new();

        let runner = Arc::clone(&segments);
        let run_token = token.clone();
        let handle = tokio::spawn(async move { runner.run(run_token).await });

        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let (ra, rb) = tokio::join!(
            segments.join(&token, a.clone()),
            segments.join(&token, b.clone())
        );
        ra.unwrap();
        rb.unwrap();

        for counter in [&a, &b] {
            assert_eq!(counter.remote.load(Ordering::SeqCst), 2);
            assert_eq!(counter.inline.load(Ordering::SeqCst), 1);
        }

        token.cancel();
        assert!(matches!(handle.await.unwrap(), Err(SubsystemError::Canceled)));
    }

    #[tokio::test]
    async fn test_failing_observer_does_not_stop_others() {
        let segments = loop_with_segments().await;
        let token = CancellationToken::new();

        let runner = Arc::clone(&segments);
        let run_token = token.clone();
        tokio::spawn(async move { runner.run(run_token).await });

        let good = Arc::new(Counter::default());
        let (bad_result, good_result) = tokio::join!(
            segments.join(&token, Arc::new(Failing)),
            segments.join(&token, good.clone())
        );

        assert!(matches!(bad_result, Err(LoopError::Observer(_))));
        good_result.unwrap();
        assert_eq!(good.remote.load(Ordering::SeqCst), 2);
        token.cancel();
    }

    #[tokio::test]
    async fn test_close_fails_pending_join() {
        let segments = loop_with_segments().await;
        let token = CancellationToken::new();

        let closer = Arc::clone(&segments);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close().unwrap();
        });

        // No run task: the join can only end through close.
        let result = segments.join(&token, Arc::new(Counter::default())).await;
        assert!(matches!(result, Err(LoopError::Closed)));
        assert!(matches!(
            segments.join(&token, Arc::new(Counter::default())).await,
            Err(LoopError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_ends_run() {
        let segments = loop_with_segments().await;
        let runner = Arc::clone(&segments);
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        segments.close().unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[test]
    fn test_loop_error_mapping() {
        assert!(SubsystemError::from(LoopError::Canceled).is_canceled());
        assert!(matches!(SubsystemError::from(LoopError::Closed), SubsystemError::Loop(_)));
    }
}
