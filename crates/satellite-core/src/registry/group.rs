//! # Subsystem Group
//!
//! Fan-out/fan-in execution and ordered teardown for a set of subsystems.
//!
//! ## Run
//!
//! 1. Derive one child token from the caller's token.
//! 2. Spawn one task per subsystem, all sharing the child token. Dropping
//!    the run future cancels the token and aborts every task.
//! 3. The first failure cancels the child token; later failures are logged
//!    and counted but not returned.
//! 4. Return only after every task has exited.
//!
//! A `Canceled` error is benign only while the group token is canceled. A
//! subsystem that reports cancellation on its own while the group is still
//! live has stopped unexpectedly and is treated as failed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use satellite_telemetry::Monitor;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Subsystem, SubsystemError};

/// The error a group run returns: the first subsystem that failed.
#[derive(Debug, Clone, Error)]
#[error("{subsystem}: {error}")]
pub struct RunFailure {
    pub subsystem: &'static str,
    #[source]
    pub error: SubsystemError,
}

/// Every close error collected during a teardown.
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<(&'static str, SubsystemError)>,
}

impl CloseErrors {
    pub fn push(&mut self, subsystem: &'static str, error: SubsystemError) {
        self.errors.push((subsystem, error));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &SubsystemError)> {
        self.errors.iter().map(|(name, err)| (*name, err))
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), CloseErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (name, err)) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "close {name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn is_benign(error: &SubsystemError, group: &CancellationToken) -> bool {
    error.is_canceled() && group.is_cancelled()
}

/// Run every subsystem concurrently until all have exited.
pub async fn run_group(
    parent: &CancellationToken,
    subsystems: Vec<Arc<dyn Subsystem>>,
    monitor: &Monitor,
) -> Result<(), RunFailure> {
    let group = parent.child_token();
    // Dropping this future cancels the group; dropping the set aborts the tasks.
    let _cancel_on_drop = group.clone().drop_guard();
    let mut tasks = JoinSet::new();

    for subsystem in subsystems {
        let name = subsystem.name();
        let token = group.clone();
        monitor.record_run(name);
        debug!(subsystem = name, "Starting subsystem");

        tasks.spawn(async move {
            let result = match AssertUnwindSafe(subsystem.run(token)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(SubsystemError::Panicked(panic_message(payload.as_ref()))),
            };
            (name, result)
        });
    }

    let mut first: Option<RunFailure> = None;

    while let Some(joined) = tasks.join_next().await {
        let (name, result) = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => {
                // Only reachable when the runtime shuts down mid-run.
                error!(error = %join_err, "Subsystem task aborted");
                continue;
            }
        };

        match result {
            Ok(()) => debug!(subsystem = name, "Subsystem exited"),
            Err(err) if is_benign(&err, &group) => {
                debug!(subsystem = name, "Subsystem stopped on cancellation");
            }
            Err(err) => {
                monitor.record_failure(name);
                if first.is_none() {
                    error!(subsystem = name, error = %err, "Subsystem failed, canceling the group");
                    group.cancel();
                    first = Some(RunFailure {
                        subsystem: name,
                        error: err,
                    });
                } else {
                    error!(subsystem = name, error = %err, "Subsystem failed during shutdown");
                }
            }
        }
    }

    match first {
        Some(failure) => Err(failure),
        None => {
            info!("All subsystems exited");
            Ok(())
        }
    }
}

/// Close subsystems in close order, attempting every one.
pub fn close_in_order(
    mut subsystems: Vec<Arc<dyn Subsystem>>,
    monitor: &Monitor,
) -> Result<(), CloseErrors> {
    subsystems.sort_by_key(|s| s.id().close_rank());

    let mut errors = CloseErrors::default();
    for subsystem in subsystems {
        let name = subsystem.name();
        let result = subsystem.close();
        monitor.record_close(name, result.is_ok());
        match result {
            Ok(()) => debug!(subsystem = name, "Closed"),
            Err(err) => {
                warn!(subsystem = name, error = %err, "Close failed");
                errors.push(name, err);
            }
        }
    }

    errors.into_result()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::registry::{Lifecycle, SubsystemId, SubsystemState};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    struct Recorder {
        id: SubsystemId,
        log: Arc<Mutex<Vec<SubsystemId>>>,
        lifecycle: Lifecycle,
    }

    #[async_trait]
    impl Subsystem for Recorder {
        fn id(&self) -> SubsystemId {
            self.id
        }

        async fn run(&self, _token: CancellationToken) -> Result<(), SubsystemError> {
            Ok(())
        }

        fn close(&self) -> Result<(), SubsystemError> {
            self.log.lock().push(self.id);
            self.lifecycle.stop();
            Ok(())
        }

        fn state(&self) -> SubsystemState {
            self.lifecycle.state()
        }
    }

    fn arb_population() -> impl Strategy<Value = Vec<SubsystemId>> {
        proptest::sample::subsequence(SubsystemId::CLOSE_ORDER.to_vec(), 0..=SubsystemId::CLOSE_ORDER.len())
            .prop_shuffle()
    }

    proptest! {
        #[test]
        fn proptest_close_follows_close_order(population in arb_population()) {
            let monitor = Monitor::new().unwrap();
            let log = Arc::new(Mutex::new(Vec::new()));
            let subsystems: Vec<Arc<dyn Subsystem>> = population
                .iter()
                .map(|id| {
                    Arc::new(Recorder {
                        id: *id,
                        log: Arc::clone(&log),
                        lifecycle: Lifecycle::new(),
                    }) as Arc<dyn Subsystem>
                })
                .collect();

            prop_assert!(close_in_order(subsystems, &monitor).is_ok());

            let expected: Vec<SubsystemId> = SubsystemId::CLOSE_ORDER
                .iter()
                .copied()
                .filter(|id| population.contains(id))
                .collect();
            prop_assert_eq!(log.lock().clone(), expected);
            prop_assert_eq!(monitor.total_closes(), population.len() as u64);
        }
    }
}
