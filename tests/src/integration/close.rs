//! # Closing The Core
//!
//! Close visits every populated slot once, in close order, and is a no-op
//! on every later call.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::harness::{test_config, Fixture, DEFAULT_CLOSE_COUNT};
    use satellite_core::{CoreError, SubsystemState};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_close_is_idempotent() {
        let fixture = Fixture::default();
        let core = fixture.build(test_config());

        core.close().unwrap();
        assert_eq!(fixture.monitor.total_closes(), DEFAULT_CLOSE_COUNT as u64);

        core.close().unwrap();
        assert_eq!(fixture.monitor.total_closes(), DEFAULT_CLOSE_COUNT as u64);
        assert_eq!(fixture.monitor.closes("metainfo:loop"), 1);
    }

    #[test]
    fn test_close_without_run_stops_every_slot() {
        let mut config = test_config();
        config.graceful_exit.enabled = false;
        let core = Fixture::default().build(config);

        assert!(core
            .slot_states()
            .iter()
            .all(|(_, state)| matches!(state, SubsystemState::Constructed | SubsystemState::Unconstructed)));

        core.close().unwrap();

        for (id, state) in core.slot_states() {
            assert!(
                matches!(state, SubsystemState::Stopped | SubsystemState::Unconstructed),
                "{id} is {state:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_close_after_run_and_run_after_close() {
        let fixture = Fixture::default();
        let core = fixture.build(test_config());

        let token = CancellationToken::new();
        let canceler = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });
        core.run(&token).await.unwrap();

        core.close().unwrap();
        assert_eq!(fixture.monitor.total_closes(), DEFAULT_CLOSE_COUNT as u64);
        assert_eq!(fixture.monitor.close_failures("overlay"), 0);
        assert!(matches!(core.run(&CancellationToken::new()).await, Err(CoreError::Closed)));
    }
}
