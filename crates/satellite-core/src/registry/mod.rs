//! # Subsystem Registry
//!
//! The uniform contract every background service implements to take part in
//! the satellite core, plus the fixed identities and close order of those
//! services.
//!
//! ## Lifecycle
//!
//! ```text
//!   (slot empty) ──construct──→ Constructed ──run──→ Running ──close──→ Stopped
//!                                     │                                    ▲
//!                                     └──────────────close─────────────────┘
//! ```
//!
//! An empty slot (a subsystem disabled by configuration) is a valid terminal
//! state: it is never run and never closed.
//!
//! ## Close Order
//!
//! External-facing chores stop first, shared dependencies last. The metainfo
//! loop is always closed last because most chores iterate through it.

pub mod group;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use shared_types::StorageError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use group::{close_in_order, run_group, CloseErrors, RunFailure};

/// Identity of every subsystem slot the core knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsystemId {
    VersionChecker,
    ContactService,
    OverlayService,
    MetainfoLoop,
    RepairChecker,
    Repairer,
    AuditWorker,
    AuditChore,
    GarbageCollection,
    DbCleanup,
    Tally,
    Rollup,
    PaymentsChore,
    GracefulExit,
    Metrics,
    DowntimeDetection,
}

impl SubsystemId {
    /// Close order: external-facing first, shared dependencies last.
    pub const CLOSE_ORDER: [SubsystemId; 16] = [
        Self::DowntimeDetection,
        Self::Metrics,
        Self::GracefulExit,
        Self::PaymentsChore,
        Self::VersionChecker,
        Self::AuditChore,
        Self::AuditWorker,
        Self::GarbageCollection,
        Self::Rollup,
        Self::Tally,
        Self::DbCleanup,
        Self::Repairer,
        Self::RepairChecker,
        Self::OverlayService,
        Self::ContactService,
        Self::MetainfoLoop,
    ];

    /// Name used in logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::VersionChecker => "version",
            Self::ContactService => "contact:service",
            Self::OverlayService => "overlay",
            Self::MetainfoLoop => "metainfo:loop",
            Self::RepairChecker => "checker",
            Self::Repairer => "repairer",
            Self::AuditWorker => "audit:worker",
            Self::AuditChore => "audit:chore",
            Self::GarbageCollection => "garbage-collection",
            Self::DbCleanup => "dbcleanup",
            Self::Tally => "tally",
            Self::Rollup => "rollup",
            Self::PaymentsChore => "payments:chore",
            Self::GracefulExit => "gracefulexit",
            Self::Metrics => "metrics",
            Self::DowntimeDetection => "downtime:detection",
        }
    }

    /// Position in [`SubsystemId::CLOSE_ORDER`].
    #[must_use]
    pub fn close_rank(&self) -> usize {
        Self::CLOSE_ORDER
            .iter()
            .position(|id| id == self)
            .unwrap_or(Self::CLOSE_ORDER.len())
    }
}

impl fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle state of a constructed subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemState {
    /// Slot left empty by configuration.
    Unconstructed,
    Constructed,
    Running,
    Stopped,
}

/// Errors a subsystem reports from `run` or `close`.
#[derive(Debug, Clone, Error)]
pub enum SubsystemError {
    /// The task stopped because its context was canceled.
    #[error("context canceled")]
    Canceled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("metainfo loop: {0}")]
    Loop(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl SubsystemError {
    /// True for the cancellation-shaped error.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Trait that every supervised subsystem implements.
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn id(&self) -> SubsystemId;

    fn name(&self) -> &'static str {
        self.id().name()
    }

    /// Run until `token` is canceled, the subsystem is closed, or it fails.
    async fn run(&self, token: CancellationToken) -> Result<(), SubsystemError>;

    /// Release resources. Must be safe to call more than once.
    fn close(&self) -> Result<(), SubsystemError>;

    fn state(&self) -> SubsystemState;
}

const CONSTRUCTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Atomic lifecycle tracker embedded in every subsystem.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self(AtomicU8::new(CONSTRUCTED))
    }

    /// Move to `Running`; false when already stopped.
    pub fn start(&self) -> bool {
        match self
            .0
            .compare_exchange(CONSTRUCTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == RUNNING,
        }
    }

    /// Move to `Stopped`; true only for the first call.
    pub fn stop(&self) -> bool {
        self.0.swap(STOPPED, Ordering::AcqRel) != STOPPED
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire) == STOPPED
    }

    #[must_use]
    pub fn state(&self) -> SubsystemState {
        match self.0.load(Ordering::Acquire) {
            CONSTRUCTED => SubsystemState::Constructed,
            RUNNING => SubsystemState::Running,
            _ => SubsystemState::Stopped,
        }
    }
}
