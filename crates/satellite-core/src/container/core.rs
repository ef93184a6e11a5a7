//! # Satellite Core
//!
//! Builds every background subsystem of the satellite in a fixed order, runs
//! them as one group and closes them in reverse dependency order.
//!
//! ## Construction Order
//!
//! ```text
//! config → version → dialer → contact → overlay → live accounting
//!        → project usage → orders → metainfo + loop → repair → audit
//!        → garbage collection → db cleanup → tally + rollup → payments
//!        → graceful exit (optional) → metrics → downtime
//! ```
//!
//! A failing step tears down everything built before it and reports both
//! the step error and any teardown error. A `Core` is only ever handed out
//! complete.
//!
//! ## Lifecycle
//!
//! ```text
//!   new ──→ ready ──run──→ running ──close──→ closed
//!             │                                 ▲
//!             └──────────────close──────────────┘
//! ```
//!
//! `run` may be called once. `close` may be called any number of times;
//! only the first call closes anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use satellite_telemetry::Monitor;
use shared_types::{
    FullIdentity, LiveAccounting, NodeAddress, NodeDossier, NodeId, NodeType, PointerDb, Repositories, RevocationDb,
    VersionError, VersionInfo,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::accounting::{ProjectUsage, Rollup, Tally};
use crate::audit;
use crate::container::config::{BillingProvider, Config, ConfigError};
use crate::contact;
use crate::dbcleanup;
use crate::downtime;
use crate::gc;
use crate::gracefulexit;
use crate::metainfo::{self, Loop};
use crate::metrics;
use crate::orders;
use crate::overlay;
use crate::payments::{self, coinpayments, Accounts, Pricing};
use crate::registry::{
    close_in_order, run_group, CloseErrors, RunFailure, Subsystem, SubsystemError, SubsystemId, SubsystemState,
};
use crate::repair::{Checker, Repairer, SegmentRepairer};
use crate::rpc::{Dialer, Options, TlsError};
use crate::version;

/// Why a construction step failed.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Subsystem(#[from] SubsystemError),
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// A construction step failed; `teardown` holds the close errors of the
    /// subsystems built before it, if any.
    #[error("construct {step}: {source}{}", teardown_note(.teardown))]
    Construction {
        step: &'static str,
        #[source]
        source: BuildError,
        teardown: Option<CloseErrors>,
    },

    #[error("run: {0}")]
    Run(#[from] RunFailure),

    #[error("core is already running")]
    AlreadyRunning,

    #[error("core is closed")]
    Closed,
}

fn teardown_note(teardown: &Option<CloseErrors>) -> String {
    match teardown {
        Some(errors) => format!(" (teardown: {errors})"),
        None => String::new(),
    }
}

/// Subsystems the core runs; contact and overlay are only closed.
const RUN_SET: [SubsystemId; 14] = [
    SubsystemId::VersionChecker,
    SubsystemId::MetainfoLoop,
    SubsystemId::RepairChecker,
    SubsystemId::Repairer,
    SubsystemId::AuditWorker,
    SubsystemId::AuditChore,
    SubsystemId::GarbageCollection,
    SubsystemId::DbCleanup,
    SubsystemId::Tally,
    SubsystemId::Rollup,
    SubsystemId::PaymentsChore,
    SubsystemId::GracefulExit,
    SubsystemId::Metrics,
    SubsystemId::DowntimeDetection,
];

/// Tracks the current step and every subsystem built so far.
#[derive(Default)]
struct Assembly {
    step: &'static str,
    built: Vec<Arc<dyn Subsystem>>,
}

impl Assembly {
    fn step(&mut self, step: &'static str) {
        debug!(step, "Constructing");
        self.step = step;
    }

    fn keep<T: Subsystem + 'static>(&mut self, subsystem: Arc<T>) -> Arc<T> {
        self.built.push(Arc::clone(&subsystem) as Arc<dyn Subsystem>);
        subsystem
    }

    /// Tear down everything built so far and report the failed step.
    fn fail(self, source: BuildError, monitor: &Monitor) -> CoreError {
        let step = self.step;
        error!(step, error = %source, "Construction failed, tearing down");
        let teardown = close_in_order(self.built, monitor).err();
        CoreError::Construction { step, source, teardown }
    }
}

/// The satellite's subsystem supervisor.
pub struct Core {
    id: NodeId,
    identity: Arc<FullIdentity>,
    monitor: Monitor,

    version: Arc<version::Checker>,
    dialer: Dialer,
    contact: Arc<contact::Service>,
    overlay: Arc<overlay::Service>,
    live_accounting: Arc<dyn LiveAccounting>,
    project_usage: Arc<ProjectUsage>,
    orders: Arc<orders::Service>,
    metainfo: Arc<metainfo::Service>,
    metainfo_loop: Arc<Loop>,
    repair_checker: Arc<Checker>,
    repairer: Arc<Repairer>,
    audit_queue: Arc<audit::Queue>,
    audit_worker: Arc<audit::Worker>,
    audit_chore: Arc<audit::Chore>,
    garbage_collection: Arc<gc::Service>,
    db_cleanup: Arc<dbcleanup::Chore>,
    tally: Arc<Tally>,
    rollup: Arc<Rollup>,
    accounts: Arc<dyn Accounts>,
    payments_chore: Option<Arc<coinpayments::Chore>>,
    graceful_exit: Option<Arc<gracefulexit::Chore>>,
    metrics: Arc<metrics::Chore>,
    downtime: Arc<downtime::Service>,
    downtime_detection: Arc<downtime::DetectionChore>,

    started: AtomicBool,
    closed: AtomicBool,
}

impl Core {
    /// Build every subsystem in order. On failure, everything built so far
    /// is closed before the error is returned.
    #[allow(clippy::too_many_arguments)]
    #[instrument(name = "core_construct", skip_all, fields(node_id = %identity.id))]
    pub fn new(
        identity: Arc<FullIdentity>,
        repositories: Arc<dyn Repositories>,
        pointer_db: Arc<dyn PointerDb>,
        revocation_db: Arc<dyn RevocationDb>,
        live_accounting: Arc<dyn LiveAccounting>,
        version_info: VersionInfo,
        config: Config,
        monitor: Monitor,
    ) -> Result<Self, CoreError> {
        let mut assembly = Assembly::default();
        let result = Self::assemble(
            &mut assembly,
            identity,
            repositories,
            pointer_db,
            revocation_db,
            live_accounting,
            &version_info,
            &config,
            &monitor,
        );

        match result {
            Ok(core) => {
                info!(subsystems = core.run_slots().len(), "Satellite core constructed");
                Ok(core)
            }
            Err(source) => Err(assembly.fail(source, &monitor)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        assembly: &mut Assembly,
        identity: Arc<FullIdentity>,
        repositories: Arc<dyn Repositories>,
        pointer_db: Arc<dyn PointerDb>,
        revocation_db: Arc<dyn RevocationDb>,
        live_accounting: Arc<dyn LiveAccounting>,
        version_info: &VersionInfo,
        config: &Config,
        monitor: &Monitor,
    ) -> Result<Self, BuildError> {
        let id = identity.id;

        assembly.step("config");
        config.validate()?;

        assembly.step("version");
        if !version_info.is_zero() {
            info!(
                version = %version_info.version,
                commit = %version_info.commit_hash,
                release = version_info.release,
                "Version info"
            );
        }
        let version = assembly.keep(Arc::new(version::Checker::new(version_info, &config.version)?));

        assembly.step("dialer");
        let options = Options::new(&identity, &config.server, revocation_db)?;
        let dialer = Dialer::new(Arc::new(options), config.server.dial_timeout());

        assembly.step("contact");
        let address = match config.contact.external_address.trim() {
            "" => config.server.address.clone(),
            external => external.to_string(),
        };
        let local = NodeDossier {
            id,
            address: NodeAddress::tcp(address),
            node_type: NodeType::Satellite,
            version: version.running().clone(),
        };
        let contact = assembly.keep(Arc::new(contact::Service::new(
            local,
            dialer.clone(),
            repositories.peer_identities(),
        )));

        assembly.step("overlay");
        let overlay = assembly.keep(Arc::new(overlay::Service::new(
            repositories.overlay_cache(),
            config.overlay.clone(),
        )));
        contact.bind_overlay(Arc::clone(&overlay));

        assembly.step("live accounting");
        debug!(subsystem = "live-accounting", "Using externally owned live accounting cache");

        assembly.step("accounting usage");
        let project_usage = Arc::new(ProjectUsage::new(
            repositories.project_accounting(),
            Arc::clone(&live_accounting),
            config.rollup.max_alpha_usage_bytes,
        ));

        assembly.step("orders");
        let orders = Arc::new(orders::Service::new(
            Arc::clone(&identity),
            repositories.orders(),
            &config.orders,
        ));

        assembly.step("metainfo");
        let metainfo = Arc::new(metainfo::Service::new(Arc::clone(&pointer_db), repositories.buckets()));
        let metainfo_loop = assembly.keep(Arc::new(Loop::new(pointer_db, config.metainfo.clone())));

        assembly.step("repair");
        let repair_checker = assembly.keep(Arc::new(Checker::new(
            Arc::clone(&metainfo_loop),
            Arc::clone(&overlay),
            repositories.repair_queue(),
            repositories.irreparable(),
            &config.checker,
        )));
        let segment_repairer = SegmentRepairer::new(
            Arc::clone(&metainfo),
            Arc::clone(&orders),
            Arc::clone(&overlay),
            repositories.irreparable(),
            &config.repairer,
        );
        let repairer = assembly.keep(Arc::new(Repairer::new(
            repositories.repair_queue(),
            segment_repairer,
            &config.repairer,
        )));

        assembly.step("audit");
        let audit_queue = Arc::new(audit::Queue::new());
        let verifier = audit::Verifier::new(
            Arc::clone(&metainfo),
            Arc::clone(&orders),
            Arc::clone(&overlay),
            repositories.containment(),
            dialer.clone(),
            &config.audit,
        );
        let reporter = audit::Reporter::new(Arc::clone(&overlay), repositories.containment(), &config.audit);
        let audit_worker = assembly.keep(Arc::new(audit::Worker::new(
            Arc::clone(&audit_queue),
            verifier,
            reporter,
            &config.audit,
        )?));
        let audit_chore = assembly.keep(Arc::new(audit::Chore::new(
            Arc::clone(&audit_queue),
            Arc::clone(&metainfo_loop),
            &config.audit,
        )));

        assembly.step("garbage collection");
        let garbage_collection = assembly.keep(Arc::new(gc::Service::new(
            &config.garbage_collection,
            dialer.clone(),
            repositories.overlay_cache(),
            Arc::clone(&metainfo_loop),
        )));

        assembly.step("db cleanup");
        let db_cleanup = assembly.keep(Arc::new(dbcleanup::Chore::new(repositories.orders(), &config.db_cleanup)));

        assembly.step("accounting");
        let tally = assembly.keep(Arc::new(Tally::new(
            Arc::clone(&metainfo_loop),
            Arc::clone(&live_accounting),
            repositories.project_accounting(),
            repositories.storagenode_accounting(),
            &config.tally,
        )));
        let rollup = assembly.keep(Arc::new(Rollup::new(
            repositories.storagenode_accounting(),
            &config.rollup,
        )));

        assembly.step("payments");
        let (accounts, payments_chore) = match config.payments.provider {
            BillingProvider::Mock => (payments::mock::accounts(), None),
            BillingProvider::CoinPayments => {
                let service = Arc::new(coinpayments::Service::new(
                    &config.payments.coinpayments,
                    repositories.billing(),
                    repositories.project_accounting(),
                    Pricing::from_config(&config.payments),
                )?);
                let chore = assembly.keep(Arc::new(coinpayments::Chore::new(
                    Arc::clone(&service),
                    &config.payments.coinpayments,
                )));
                (service as Arc<dyn Accounts>, Some(chore))
            }
        };

        assembly.step("graceful exit");
        let graceful_exit = if config.graceful_exit.enabled {
            Some(assembly.keep(Arc::new(gracefulexit::Chore::new(
                repositories.graceful_exit(),
                Arc::clone(&metainfo_loop),
                &config.graceful_exit,
            ))))
        } else {
            info!(subsystem = "gracefulexit", "disabled");
            None
        };

        assembly.step("metrics");
        let metrics = assembly.keep(Arc::new(metrics::Chore::new(
            monitor.clone(),
            Arc::clone(&metainfo_loop),
            &config.metrics,
        )));

        assembly.step("downtime");
        let downtime = Arc::new(downtime::Service::new(Arc::clone(&overlay), Arc::clone(&contact)));
        let downtime_detection = assembly.keep(Arc::new(downtime::DetectionChore::new(
            &config.downtime,
            Arc::clone(&downtime),
            Arc::clone(&overlay),
            repositories.downtime_tracking(),
        )));

        Ok(Self {
            id,
            identity,
            monitor: monitor.clone(),
            version,
            dialer,
            contact,
            overlay,
            live_accounting,
            project_usage,
            orders,
            metainfo,
            metainfo_loop,
            repair_checker,
            repairer,
            audit_queue,
            audit_worker,
            audit_chore,
            garbage_collection,
            db_cleanup,
            tally,
            rollup,
            accounts,
            payments_chore,
            graceful_exit,
            metrics,
            downtime,
            downtime_detection,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// The subsystem in slot `id`, if the slot is populated.
    fn slot(&self, id: SubsystemId) -> Option<Arc<dyn Subsystem>> {
        let subsystem: Arc<dyn Subsystem> = match id {
            SubsystemId::VersionChecker => self.version.clone(),
            SubsystemId::ContactService => self.contact.clone(),
            SubsystemId::OverlayService => self.overlay.clone(),
            SubsystemId::MetainfoLoop => self.metainfo_loop.clone(),
            SubsystemId::RepairChecker => self.repair_checker.clone(),
            SubsystemId::Repairer => self.repairer.clone(),
            SubsystemId::AuditWorker => self.audit_worker.clone(),
            SubsystemId::AuditChore => self.audit_chore.clone(),
            SubsystemId::GarbageCollection => self.garbage_collection.clone(),
            SubsystemId::DbCleanup => self.db_cleanup.clone(),
            SubsystemId::Tally => self.tally.clone(),
            SubsystemId::Rollup => self.rollup.clone(),
            SubsystemId::Metrics => self.metrics.clone(),
            SubsystemId::DowntimeDetection => self.downtime_detection.clone(),
            SubsystemId::PaymentsChore => {
                return self.payments_chore.clone().map(|chore| chore as Arc<dyn Subsystem>)
            }
            SubsystemId::GracefulExit => {
                return self.graceful_exit.clone().map(|chore| chore as Arc<dyn Subsystem>)
            }
        };
        Some(subsystem)
    }

    /// Populated slots that take part in `run`.
    pub fn run_slots(&self) -> Vec<Arc<dyn Subsystem>> {
        RUN_SET.iter().filter_map(|id| self.slot(*id)).collect()
    }

    /// Populated slots in close order.
    pub fn close_slots(&self) -> Vec<Arc<dyn Subsystem>> {
        SubsystemId::CLOSE_ORDER
            .iter()
            .filter_map(|id| self.slot(*id))
            .collect()
    }

    /// Names of the subsystems `run` launches.
    pub fn subsystem_names(&self) -> Vec<&'static str> {
        self.run_slots().iter().map(|s| s.name()).collect()
    }

    /// State of every slot, `Unconstructed` for slots left empty.
    pub fn slot_states(&self) -> Vec<(SubsystemId, SubsystemState)> {
        SubsystemId::CLOSE_ORDER
            .iter()
            .map(|id| {
                let state = self.slot(*id).map_or(SubsystemState::Unconstructed, |s| s.state());
                (*id, state)
            })
            .collect()
    }

    /// Run every populated slot until the parent token is canceled or one
    /// of them fails. Returns only after every task has exited.
    pub async fn run(&self, parent: &CancellationToken) -> Result<(), CoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CoreError::AlreadyRunning);
        }

        info!(node_id = %self.id, subsystems = ?self.subsystem_names(), "Running satellite core");
        run_group(parent, self.run_slots(), &self.monitor).await?;
        Ok(())
    }

    /// Close every populated slot in close order. Only the first call does
    /// anything; later calls return `Ok(())`.
    pub fn close(&self) -> Result<(), CloseErrors> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(node_id = %self.id, "Closing satellite core");
        close_in_order(self.close_slots(), &self.monitor)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn identity(&self) -> &Arc<FullIdentity> {
        &self.identity
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn version(&self) -> &Arc<version::Checker> {
        &self.version
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub fn contact(&self) -> &Arc<contact::Service> {
        &self.contact
    }

    pub fn overlay(&self) -> &Arc<overlay::Service> {
        &self.overlay
    }

    pub fn live_accounting(&self) -> &Arc<dyn LiveAccounting> {
        &self.live_accounting
    }

    pub fn project_usage(&self) -> &Arc<ProjectUsage> {
        &self.project_usage
    }

    pub fn orders(&self) -> &Arc<orders::Service> {
        &self.orders
    }

    pub fn metainfo(&self) -> &Arc<metainfo::Service> {
        &self.metainfo
    }

    pub fn audit_queue(&self) -> &Arc<audit::Queue> {
        &self.audit_queue
    }

    pub fn accounts(&self) -> &Arc<dyn Accounts> {
        &self.accounts
    }

    pub fn downtime(&self) -> &Arc<downtime::Service> {
        &self.downtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryLiveAccounting, MemoryPointerDb, MemoryRepositories, MemoryRevocationDb};
    use crate::registry::Lifecycle;

    fn build(config: Config, version_info: VersionInfo) -> (Result<Core, CoreError>, Monitor) {
        let monitor = Monitor::new().unwrap();
        let core = Core::new(
            Arc::new(FullIdentity::from_seed([60; 32])),
            Arc::new(MemoryRepositories::default()),
            Arc::new(MemoryPointerDb::default()),
            Arc::new(MemoryRevocationDb::default()),
            Arc::new(MemoryLiveAccounting::default()),
            version_info,
            config,
            monitor.clone(),
        );
        (core, monitor)
    }

    #[test]
    fn test_default_construction_populates_every_slot_but_billing() {
        let (core, _) = build(Config::default(), VersionInfo::default());
        let core = core.unwrap();

        assert_eq!(core.run_slots().len(), 13);
        assert_eq!(core.close_slots().len(), 15);
        assert!(!core.subsystem_names().contains(&"payments:chore"));
        assert_eq!(core.id(), FullIdentity::from_seed([60; 32]).id);

        let states = core.slot_states();
        assert!(states.contains(&(SubsystemId::PaymentsChore, SubsystemState::Unconstructed)));
        assert!(states.contains(&(SubsystemId::Tally, SubsystemState::Constructed)));
    }

    #[test]
    fn test_close_slots_follow_close_order() {
        let (core, _) = build(Config::default(), VersionInfo::default());
        let names: Vec<&str> = core.unwrap().close_slots().iter().map(|s| s.name()).collect();
        assert_eq!(names.first(), Some(&"downtime:detection"));
        assert_eq!(names.last(), Some(&"metainfo:loop"));
    }

    #[test]
    fn test_contact_advertises_external_address() {
        let mut config = Config::default();
        config.contact.external_address = "sat.example.com:7777".into();
        let (core, _) = build(config, VersionInfo::default());
        assert_eq!(core.unwrap().contact().local().address.address, "sat.example.com:7777");
    }

    #[test]
    fn test_invalid_config_fails_first_step() {
        let mut config = Config::default();
        config.tally.interval_secs = 0;
        let (result, monitor) = build(config, VersionInfo::default());

        match result {
            Err(CoreError::Construction { step, teardown, .. }) => {
                assert_eq!(step, "config");
                assert!(teardown.is_none());
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert_eq!(monitor.total_closes(), 0);
    }

    #[test]
    fn test_error_message_names_step() {
        let bad_version = VersionInfo {
            version: "not-a-version".into(),
            ..VersionInfo::default()
        };
        let (result, _) = build(Config::default(), bad_version);
        let message = result.err().unwrap().to_string();
        assert!(message.starts_with("construct version:"), "{message}");
    }

    struct StuckClose(Lifecycle);

    #[async_trait::async_trait]
    impl Subsystem for StuckClose {
        fn id(&self) -> SubsystemId {
            SubsystemId::Repairer
        }

        async fn run(&self, _token: CancellationToken) -> Result<(), SubsystemError> {
            Ok(())
        }

        fn close(&self) -> Result<(), SubsystemError> {
            self.0.stop();
            Err(SubsystemError::Failed("queue flush timed out".into()))
        }

        fn state(&self) -> SubsystemState {
            self.0.state()
        }
    }

    #[test]
    fn test_failed_step_reports_teardown_errors() {
        let monitor = Monitor::new().unwrap();
        let mut assembly = Assembly::default();
        assembly.step("repair");
        let repairer = assembly.keep(Arc::new(StuckClose(Lifecycle::new())));
        assembly.step("audit");

        let err = assembly.fail(
            BuildError::Subsystem(SubsystemError::Config("worker_concurrency must be positive".into())),
            &monitor,
        );

        let message = err.to_string();
        match &err {
            CoreError::Construction {
                step,
                teardown: Some(teardown),
                ..
            } => {
                assert_eq!(*step, "audit");
                assert_eq!(teardown.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(message.starts_with("construct audit: invalid configuration: worker_concurrency"), "{message}");
        assert!(message.contains("close repairer: queue flush timed out"), "{message}");
        assert_eq!(repairer.state(), SubsystemState::Stopped);
        assert_eq!(monitor.close_failures("repairer"), 1);
    }

    #[tokio::test]
    async fn test_run_after_close_is_rejected() {
        let (core, _) = build(Config::default(), VersionInfo::default());
        let core = core.unwrap();
        core.close().unwrap();
        assert!(matches!(core.run(&CancellationToken::new()).await, Err(CoreError::Closed)));
    }
}
