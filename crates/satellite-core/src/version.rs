//! Running-version check.
//!
//! Periodically compares the binary's version against the configured minimum
//! and records whether the process is still allowed to operate. Development
//! builds (zero version info) are always allowed.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use shared_types::{NodeVersion, SemVer, VersionError, VersionInfo};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chore::Cycle;
use crate::container::config::VersionConfig;
use crate::registry::{Lifecycle, Subsystem, SubsystemError, SubsystemId, SubsystemState};

pub struct Checker {
    running: NodeVersion,
    development: bool,
    minimum: Option<SemVer>,
    allowed: AtomicBool,
    cycle: Cycle,
    lifecycle: Lifecycle,
}

impl Checker {
    /// Fails when the build metadata or the configured minimum is malformed.
    pub fn new(info: &VersionInfo, config: &VersionConfig) -> Result<Self, VersionError> {
        let running = info.to_node_version()?;
        let minimum = match config.minimum_version.trim() {
            "" => None,
            raw => Some(raw.parse::<SemVer>()?),
        };

        Ok(Self {
            running,
            development: info.is_zero(),
            minimum,
            allowed: AtomicBool::new(true),
            cycle: Cycle::new(config.check_interval()),
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn running(&self) -> &NodeVersion {
        &self.running
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::Acquire)
    }

    /// Re-evaluate the running version against the minimum.
    pub fn check(&self) -> bool {
        let allowed = self.development
            || self.minimum.map_or(true, |minimum| self.running.version >= minimum);

        let previous = self.allowed.swap(allowed, Ordering::AcqRel);
        if !allowed && previous {
            warn!(
                subsystem = "version",
                running = %self.running.version,
                minimum = ?self.minimum.map(|v| v.to_string()),
                "Running version is below the allowed minimum"
            );
        } else if allowed && !previous {
            info!(subsystem = "version", running = %self.running.version, "Running version allowed again");
        }
        allowed
    }
}

#[async_trait]
impl Subsystem for Checker {
    fn id(&self) -> SubsystemId {
        SubsystemId::VersionChecker
    }

    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError> {
        if !self.lifecycle.start() {
            return Ok(());
        }
        self.cycle
            .run(&token, move || async move {
                self.check();
                Ok(())
            })
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
