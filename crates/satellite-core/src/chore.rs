//! Periodic execution helper shared by the satellite chores.
//!
//! A `Cycle` invokes a function immediately and then once per interval until
//! either the caller's token is canceled (`Err(Canceled)`) or the cycle is
//! stopped through `close` (`Ok(())`). Both are observed while the function
//! is still running, so a slow iteration never delays shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::SubsystemError;

#[derive(Debug)]
pub struct Cycle {
    interval: Duration,
    stop: CancellationToken,
}

impl Cycle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop: CancellationToken::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `f` on every tick.
    pub async fn run<F, Fut>(&self, token: &CancellationToken, mut f: F) -> Result<(), SubsystemError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), SubsystemError>>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SubsystemError::Canceled),
                _ = self.stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SubsystemError::Canceled),
                _ = self.stop.cancelled() => return Ok(()),
                result = f() => result?,
            }
        }
    }

    /// Stop the cycle; a running `run` returns `Ok(())`.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
