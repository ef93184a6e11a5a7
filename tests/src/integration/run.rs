//! # Running The Core
//!
//! Every populated run slot is launched under one group. Parent
//! cancellation and close both end the run cleanly; the first real failure
//! cancels the rest and is returned.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::harness::{
        test_config, FailingNodeAccounting, FailingOrders, Fixture, DEFAULT_CLOSE_COUNT, DEFAULT_RUN_COUNT,
    };
    use satellite_core::adapters::memory::{inline_pointer, remote_pointer};
    use satellite_core::adapters::MemoryRepositories;
    use satellite_core::payments::Accounts;
    use satellite_core::{Core, CoreError};
    use shared_types::PointerDb;
    use tokio_util::sync::CancellationToken;

    fn cancel_after(token: &CancellationToken, delay: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    async fn run_with_timeout(core: &Core, token: &CancellationToken) -> Result<(), CoreError> {
        tokio::time::timeout(Duration::from_secs(10), core.run(token))
            .await
            .expect("run did not return")
    }

    #[tokio::test]
    async fn test_parent_cancel_returns_ok() {
        let fixture = Fixture::default();
        let core = fixture.build(test_config());
        let token = CancellationToken::new();
        cancel_after(&token, Duration::from_millis(100));

        run_with_timeout(&core, &token).await.unwrap();

        assert_eq!(fixture.monitor.total_runs(), DEFAULT_RUN_COUNT as u64);
        assert_eq!(fixture.monitor.total_failures(), 0);
        for name in core.subsystem_names() {
            assert_eq!(fixture.monitor.runs(name), 1, "{name}");
        }
        // Contact and overlay are close-only.
        assert_eq!(fixture.monitor.runs("contact:service"), 0);
        assert_eq!(fixture.monitor.runs("overlay"), 0);

        core.close().unwrap();
    }

    #[tokio::test]
    async fn test_first_failure_cancels_siblings_and_is_returned() {
        let repositories = MemoryRepositories::default().with_orders(Arc::new(FailingOrders));
        let fixture = Fixture::with_repositories(repositories);
        let core = fixture.build(test_config());

        // No parent cancellation: only the failure can end the run.
        let token = CancellationToken::new();
        let err = run_with_timeout(&core, &token).await.unwrap_err();

        match err {
            CoreError::Run(failure) => {
                assert_eq!(failure.subsystem, "dbcleanup");
                assert!(failure.error.to_string().contains("serials table unavailable"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!token.is_cancelled());
        assert_eq!(fixture.monitor.total_failures(), 1);
        assert_eq!(fixture.monitor.failures("dbcleanup"), 1);

        core.close().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_failures_return_one_and_count_all() {
        let repositories = MemoryRepositories::default()
            .with_orders(Arc::new(FailingOrders))
            .with_storagenode_accounting(Arc::new(FailingNodeAccounting));
        let fixture = Fixture::with_repositories(repositories);
        let mut config = test_config();
        // Keep tally parked in the loop so it stops on cancellation instead of failing.
        config.metainfo.coalesce_duration_ms = 200;
        let core = fixture.build(config);

        let err = run_with_timeout(&core, &CancellationToken::new()).await.unwrap_err();
        let CoreError::Run(failure) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(["dbcleanup", "rollup"].contains(&failure.subsystem));
        assert_eq!(fixture.monitor.failures("dbcleanup"), 1);
        assert_eq!(fixture.monitor.failures("rollup"), 1);
        assert_eq!(fixture.monitor.total_failures(), 2);

        core.close().unwrap();
    }

    #[tokio::test]
    async fn test_close_during_run_ends_run_cleanly() {
        let fixture = Fixture::default();
        let core = fixture.build(test_config());

        let runner = Arc::clone(&core);
        let handle = tokio::spawn(async move { runner.run(&CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        core.close().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("run did not return after close")
            .unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(fixture.monitor.total_failures(), 0);
        assert_eq!(fixture.monitor.total_closes(), DEFAULT_CLOSE_COUNT as u64);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let core = Fixture::default().build(test_config());
        let token = CancellationToken::new();

        let runner = Arc::clone(&core);
        let run_token = token.clone();
        let handle = tokio::spawn(async move { runner.run(&run_token).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(core.run(&token).await, Err(CoreError::AlreadyRunning)));

        token.cancel();
        handle.await.unwrap().unwrap();
        core.close().unwrap();
    }

    #[tokio::test]
    async fn test_disabled_graceful_exit_is_neither_run_nor_closed() {
        let fixture = Fixture::default();
        let mut config = test_config();
        config.graceful_exit.enabled = false;
        let core = fixture.build(config);

        let token = CancellationToken::new();
        cancel_after(&token, Duration::from_millis(50));
        run_with_timeout(&core, &token).await.unwrap();
        core.close().unwrap();

        assert_eq!(fixture.monitor.total_runs(), DEFAULT_RUN_COUNT as u64 - 1);
        assert_eq!(fixture.monitor.total_closes(), DEFAULT_CLOSE_COUNT as u64 - 1);
        assert_eq!(fixture.monitor.runs("gracefulexit"), 0);
        assert_eq!(fixture.monitor.closes("gracefulexit"), 0);
    }

    #[tokio::test]
    async fn test_mock_billing_has_no_chore() {
        let fixture = Fixture::default();
        let core = fixture.build(test_config());

        let token = CancellationToken::new();
        cancel_after(&token, Duration::from_millis(50));
        run_with_timeout(&core, &token).await.unwrap();
        core.close().unwrap();

        assert_eq!(fixture.monitor.runs("payments:chore"), 0);
        assert_eq!(fixture.monitor.closes("payments:chore"), 0);
        assert_eq!(core.accounts().balance("user").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metrics_chore_publishes_segment_counts() {
        let fixture = Fixture::default();
        fixture.pointers.put("p/b/one", remote_pointer("p", "b", &[1, 2, 3, 4])).await.unwrap();
        fixture.pointers.put("p/b/two", remote_pointer("p", "b", &[1, 2, 3, 4])).await.unwrap();
        fixture.pointers.put("p/b/small", inline_pointer("p", "b", b"tiny")).await.unwrap();
        let core = fixture.build(test_config());

        let token = CancellationToken::new();
        let runner = Arc::clone(&core);
        let run_token = token.clone();
        let handle = tokio::spawn(async move { runner.run(&run_token).await });

        let monitor = fixture.monitor.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while monitor.segment_count("remote") != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("segment gauge never updated");
        assert_eq!(fixture.monitor.segment_count("inline"), 1);

        token.cancel();
        handle.await.unwrap().unwrap();
        core.close().unwrap();
    }
}
