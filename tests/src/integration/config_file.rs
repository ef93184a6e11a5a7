//! # File Configuration
//!
//! A TOML file layered over the defaults drives which optional slots the
//! core populates.

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::harness::{Fixture, DEFAULT_RUN_COUNT};
    use satellite_core::container::ConfigError;
    use satellite_core::{Config, CoreError};

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_settings_shape_the_core() {
        let file = write_config(
            r#"
[contact]
external_address = "sat.example.test:7777"

[graceful_exit]
enabled = false

[payments]
provider = "coinpayments"

[payments.coinpayments]
public_key = "public"
private_key = "private"
"#,
        );

        let config = Config::from_file(file.path()).unwrap();
        let core = Fixture::default().build(config);

        assert_eq!(core.contact().local().address.address, "sat.example.test:7777");
        let names = core.subsystem_names();
        assert!(names.contains(&"payments:chore"));
        assert!(!names.contains(&"gracefulexit"));
        assert_eq!(names.len(), DEFAULT_RUN_COUNT);
    }

    #[test]
    fn test_invalid_file_value_fails_at_config_step() {
        let file = write_config("[tally]\ninterval_secs = 0\n");
        let config = Config::from_file(file.path()).unwrap();

        match Fixture::default().try_build(config) {
            Err(CoreError::Construction { step, teardown, .. }) => {
                assert_eq!(step, "config");
                assert!(teardown.is_none());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("construction unexpectedly succeeded"),
        }
    }

    #[test]
    fn test_unreadable_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config("[graceful_exit]\nenabled = false\n");
        let mut config = Config::from_file(file.path()).unwrap();
        config
            .apply_vars(|key| (key == "SATELLITE_GRACEFUL_EXIT_ENABLED").then(|| "true".to_string()))
            .unwrap();

        let core = Fixture::default().build(config);
        assert!(core.subsystem_names().contains(&"gracefulexit"));
    }
}
