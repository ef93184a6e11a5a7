//! Fixtures shared by the integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use satellite_core::adapters::memory::{MemoryLiveAccounting, MemoryPointerDb, MemoryRevocationDb};
use satellite_core::adapters::MemoryRepositories;
use satellite_core::{Config, Core, CoreError};
use satellite_telemetry::Monitor;
use shared_types::{FullIdentity, NodeRollup, NodeTally, Orders, StorageError, StoragenodeAccounting, VersionInfo};
use uuid::Uuid;

pub const IDENTITY_SEED: [u8; 32] = [0x5a; 32];

/// Subsystems the default configuration runs (mock billing, graceful exit on).
pub const DEFAULT_RUN_COUNT: usize = 13;

/// Subsystems the default configuration closes.
pub const DEFAULT_CLOSE_COUNT: usize = 15;

/// Default configuration with a short loop coalesce window.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.metainfo.coalesce_duration_ms = 10;
    config
}

/// Every input of a core under test.
pub struct Fixture {
    pub repositories: MemoryRepositories,
    pub pointers: Arc<MemoryPointerDb>,
    pub monitor: Monitor,
    pub version_info: VersionInfo,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            repositories: MemoryRepositories::default(),
            pointers: Arc::new(MemoryPointerDb::default()),
            monitor: Monitor::new().expect("monitor"),
            version_info: VersionInfo::default(),
        }
    }
}

impl Fixture {
    pub fn with_repositories(repositories: MemoryRepositories) -> Self {
        Self {
            repositories,
            ..Self::default()
        }
    }

    pub fn try_build(&self, config: Config) -> Result<Core, CoreError> {
        Core::new(
            Arc::new(FullIdentity::from_seed(IDENTITY_SEED)),
            Arc::new(self.repositories.clone()),
            self.pointers.clone(),
            Arc::new(MemoryRevocationDb::default()),
            Arc::new(MemoryLiveAccounting::default()),
            self.version_info.clone(),
            config,
            self.monitor.clone(),
        )
    }

    pub fn build(&self, config: Config) -> Arc<Core> {
        Arc::new(self.try_build(config).expect("core construction"))
    }
}

/// Orders repository whose backend is gone.
pub struct FailingOrders;

#[async_trait]
impl Orders for FailingOrders {
    async fn create_serial(&self, _serial: Uuid, _expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        Err(StorageError::Backend("serials table unavailable".into()))
    }

    async fn delete_expired_serials(&self, _now: DateTime<Utc>) -> Result<usize, StorageError> {
        Err(StorageError::Backend("serials table unavailable".into()))
    }
}

/// Storage node accounting whose backend is gone.
pub struct FailingNodeAccounting;

fn accounting_down<T>() -> Result<T, StorageError> {
    Err(StorageError::Backend("accounting database unavailable".into()))
}

#[async_trait]
impl StoragenodeAccounting for FailingNodeAccounting {
    async fn save_tallies(&self, _tallies: Vec<NodeTally>) -> Result<(), StorageError> {
        accounting_down()
    }

    async fn tallies_since(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<NodeTally>, StorageError> {
        accounting_down()
    }

    async fn save_rollups(&self, _latest: DateTime<Utc>, _rollups: Vec<NodeRollup>) -> Result<(), StorageError> {
        accounting_down()
    }

    async fn last_rollup(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        accounting_down()
    }

    async fn delete_tallies_before(&self, _before: DateTime<Utc>) -> Result<usize, StorageError> {
        accounting_down()
    }
}
