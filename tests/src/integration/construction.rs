//! # Construction Pipeline
//!
//! A failed step returns an error naming the step and closes, exactly once,
//! every subsystem built before it. Optional slots stay empty when their
//! configuration disables them.

#[cfg(test)]
mod tests {
    use crate::harness::{test_config, Fixture, DEFAULT_CLOSE_COUNT, DEFAULT_RUN_COUNT};
    use satellite_core::container::BuildError;
    use satellite_core::container::config::BillingProvider;
    use satellite_core::{CoreError, SubsystemError, SubsystemId, SubsystemState};

    fn expect_construction_error(result: Result<satellite_core::Core, CoreError>) -> (&'static str, BuildError) {
        match result {
            Err(CoreError::Construction { step, source, teardown }) => {
                assert!(teardown.is_none(), "teardown failed: {teardown:?}");
                (step, source)
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("construction unexpectedly succeeded"),
        }
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[test]
    fn test_audit_failure_closes_earlier_subsystems_once() {
        let fixture = Fixture::default();
        let mut config = test_config();
        config.audit.worker_concurrency = 0;

        let (step, source) = expect_construction_error(fixture.try_build(config));
        assert_eq!(step, "audit");
        assert!(matches!(source, BuildError::Subsystem(SubsystemError::Config(_))));

        let built = ["version", "contact:service", "overlay", "metainfo:loop", "checker", "repairer"];
        for name in built {
            assert_eq!(fixture.monitor.closes(name), 1, "{name}");
        }
        assert_eq!(fixture.monitor.total_closes(), built.len() as u64);
        assert_eq!(fixture.monitor.closes("audit:worker"), 0);
        assert_eq!(fixture.monitor.total_runs(), 0);
    }

    #[test]
    fn test_tls_failure_closes_only_version_checker() {
        let fixture = Fixture::default();
        let mut config = test_config();
        config.server.peer_id_versions = "7".into();

        let (step, source) = expect_construction_error(fixture.try_build(config));
        assert_eq!(step, "dialer");
        assert!(matches!(source, BuildError::Tls(_)));
        assert_eq!(fixture.monitor.closes("version"), 1);
        assert_eq!(fixture.monitor.total_closes(), 1);
    }

    #[test]
    fn test_invalid_version_info_fails_before_anything_is_built() {
        let mut fixture = Fixture::default();
        fixture.version_info.version = "v1.x".into();

        let (step, source) = expect_construction_error(fixture.try_build(test_config()));
        assert_eq!(step, "version");
        assert!(matches!(source, BuildError::Version(_)));
        assert_eq!(fixture.monitor.total_closes(), 0);
    }

    #[test]
    fn test_billing_failure_tears_down_every_earlier_step() {
        let fixture = Fixture::default();
        let mut config = test_config();
        config.payments.provider = BillingProvider::CoinPayments;

        let (step, _) = expect_construction_error(fixture.try_build(config));
        assert_eq!(step, "payments");
        // Everything up to and including rollup.
        assert_eq!(fixture.monitor.total_closes(), 12);
        assert_eq!(fixture.monitor.closes("rollup"), 1);
        assert_eq!(fixture.monitor.closes("payments:chore"), 0);
        assert_eq!(fixture.monitor.closes("metrics"), 0);
    }

    // =========================================================================
    // OPTIONAL SLOTS
    // =========================================================================

    #[test]
    fn test_default_slots() {
        let core = Fixture::default().build(test_config());
        assert_eq!(core.run_slots().len(), DEFAULT_RUN_COUNT);
        assert_eq!(core.close_slots().len(), DEFAULT_CLOSE_COUNT);
        assert!(core.subsystem_names().contains(&"gracefulexit"));
    }

    #[test]
    fn test_graceful_exit_disabled_leaves_slot_empty() {
        let mut config = test_config();
        config.graceful_exit.enabled = false;
        let core = Fixture::default().build(config);

        assert_eq!(core.run_slots().len(), DEFAULT_RUN_COUNT - 1);
        assert_eq!(core.close_slots().len(), DEFAULT_CLOSE_COUNT - 1);
        assert!(!core.subsystem_names().contains(&"gracefulexit"));
        assert!(core
            .slot_states()
            .contains(&(SubsystemId::GracefulExit, SubsystemState::Unconstructed)));
    }

    #[test]
    fn test_coinpayments_populates_billing_slot() {
        let mut config = test_config();
        config.payments.provider = BillingProvider::CoinPayments;
        config.payments.coinpayments.public_key = "pub".into();
        config.payments.coinpayments.private_key = "priv".into();
        let core = Fixture::default().build(config);

        assert_eq!(core.run_slots().len(), DEFAULT_RUN_COUNT + 1);
        assert!(core.subsystem_names().contains(&"payments:chore"));
    }

    #[test]
    fn test_zero_version_info_still_builds_version_checker() {
        let core = Fixture::default().build(test_config());
        assert!(core.subsystem_names().contains(&"version"));
        assert!(core.version().is_allowed());
    }

    #[test]
    fn test_node_id_comes_from_identity() {
        let core = Fixture::default().build(test_config());
        let expected = shared_types::FullIdentity::from_seed(crate::harness::IDENTITY_SEED).id;
        assert_eq!(core.id(), expected);
        assert_eq!(core.contact().local().id, expected);
    }
}
