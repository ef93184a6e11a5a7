//! # Satellite Configuration
//!
//! Unified configuration for every subsystem the core constructs.
//!
//! ## Sources
//!
//! | Source | Applied by |
//! |--------|------------|
//! | Defaults | `Config::default()` |
//! | TOML file | `Config::from_file` |
//! | `SATELLITE_*` environment | `Config::apply_env` |
//!
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! overrides. Intervals are whole seconds (`*_secs`) with `Duration`
//! accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Complete satellite configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub contact: ContactConfig,
    pub overlay: OverlayConfig,
    pub metainfo: MetainfoConfig,
    pub orders: OrdersConfig,
    pub checker: CheckerConfig,
    pub repairer: RepairerConfig,
    pub audit: AuditConfig,
    pub garbage_collection: GarbageCollectionConfig,
    pub db_cleanup: DbCleanupConfig,
    pub tally: TallyConfig,
    pub rollup: RollupConfig,
    pub payments: PaymentsConfig,
    pub graceful_exit: GracefulExitConfig,
    pub metrics: MetricsConfig,
    pub downtime: DowntimeConfig,
    pub version: VersionConfig,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("{field} = {value} is out of range")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

impl Config {
    /// Load a TOML file on top of the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `SATELLITE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `SATELLITE_CONTACT_EXTERNAL_ADDRESS` | `contact.external_address` |
    /// | `SATELLITE_GRACEFUL_EXIT_ENABLED` | `graceful_exit.enabled` |
    /// | `SATELLITE_PAYMENTS_PROVIDER` | `payments.provider` |
    /// | `SATELLITE_LOG_LEVEL` | `log.level` |
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("SATELLITE_CONTACT_EXTERNAL_ADDRESS") {
            self.contact.external_address = address;
        }

        if let Some(value) = lookup("SATELLITE_GRACEFUL_EXIT_ENABLED") {
            self.graceful_exit.enabled = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "SATELLITE_GRACEFUL_EXIT_ENABLED",
                        value,
                    })
                }
            };
        }

        if let Some(value) = lookup("SATELLITE_PAYMENTS_PROVIDER") {
            self.payments.provider = match value.to_ascii_lowercase().as_str() {
                "mock" => BillingProvider::Mock,
                "coinpayments" => BillingProvider::CoinPayments,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "SATELLITE_PAYMENTS_PROVIDER",
                        value,
                    })
                }
            };
        }

        if let Some(level) = lookup("SATELLITE_LOG_LEVEL") {
            self.log.level = level;
        }

        Ok(())
    }

    /// Reject values no subsystem can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("server.dial_timeout_secs", self.server.dial_timeout_secs),
            ("metainfo.coalesce_duration_ms", self.metainfo.coalesce_duration_ms),
            ("orders.expiration_secs", self.orders.expiration_secs),
            ("checker.interval_secs", self.checker.interval_secs),
            ("repairer.interval_secs", self.repairer.interval_secs),
            ("repairer.timeout_secs", self.repairer.timeout_secs),
            ("audit.chore_interval_secs", self.audit.chore_interval_secs),
            ("audit.queue_interval_secs", self.audit.queue_interval_secs),
            ("garbage_collection.interval_secs", self.garbage_collection.interval_secs),
            ("db_cleanup.serials_interval_secs", self.db_cleanup.serials_interval_secs),
            ("tally.interval_secs", self.tally.interval_secs),
            ("rollup.interval_secs", self.rollup.interval_secs),
            (
                "payments.coinpayments.transaction_update_interval_secs",
                self.payments.coinpayments.transaction_update_interval_secs,
            ),
            (
                "payments.coinpayments.account_balance_update_interval_secs",
                self.payments.coinpayments.account_balance_update_interval_secs,
            ),
            ("graceful_exit.chore_interval_secs", self.graceful_exit.chore_interval_secs),
            ("metrics.chore_interval_secs", self.metrics.chore_interval_secs),
            ("downtime.detection_interval_secs", self.downtime.detection_interval_secs),
            ("version.check_interval_secs", self.version.check_interval_secs),
        ];
        if let Some((field, _)) = intervals.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroInterval(field));
        }

        let ratios = [
            ("overlay.audit_disqualify_ratio", self.overlay.audit_disqualify_ratio, true),
            (
                "repairer.max_excess_rate_optimal_threshold",
                self.repairer.max_excess_rate_optimal_threshold,
                false,
            ),
        ];
        for (field, value, inclusive) in ratios {
            let in_range = if inclusive {
                (0.0..=1.0).contains(&value)
            } else {
                (0.0..1.0).contains(&value)
            };
            if !in_range {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }

        Ok(())
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Log output of the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Secure transport options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the satellite advertises when no external address is set.
    pub address: String,
    /// Accepted identity versions: "latest" or a comma separated list.
    pub peer_id_versions: String,
    /// Only accept peers whose ID appears in the whitelist file.
    pub use_peer_ca_whitelist: bool,
    /// One hex node ID per line.
    pub peer_ca_whitelist_path: Option<PathBuf>,
    /// Check identities against the revocation source.
    pub revocation_check: bool,
    pub dial_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7777".to_string(),
            peer_id_versions: "latest".to_string(),
            use_peer_ca_whitelist: false,
            peer_ca_whitelist_path: None,
            revocation_check: true,
            dial_timeout_secs: 20,
        }
    }
}

impl ServerConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactConfig {
    /// Address advertised to other nodes; falls back to `server.address`.
    pub external_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// A node contacted within this window counts as online.
    pub online_window_secs: u64,
    /// Nodes whose audit success ratio drops below this are disqualified.
    pub audit_disqualify_ratio: f64,
    /// Audits required before disqualification is considered.
    pub audit_min_count: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            online_window_secs: 3600,
            audit_disqualify_ratio: 0.6,
            audit_min_count: 3,
        }
    }
}

impl OverlayConfig {
    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetainfoConfig {
    /// How long the loop waits for more observers before a pass.
    pub coalesce_duration_ms: u64,
    /// Largest segment stored inline.
    pub max_inline_segment_size: u64,
}

impl Default for MetainfoConfig {
    fn default() -> Self {
        Self {
            coalesce_duration_ms: 5000,
            max_inline_segment_size: 4096,
        }
    }
}

impl MetainfoConfig {
    pub fn coalesce_duration(&self) -> Duration {
        Duration::from_millis(self.coalesce_duration_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrdersConfig {
    pub expiration_secs: u64,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            expiration_secs: 7 * 24 * 3600,
        }
    }
}

impl OrdersConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub interval_secs: u64,
    /// Overrides every segment's repair threshold when non-zero.
    pub repair_override: u16,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            repair_override: 0,
        }
    }
}

impl CheckerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairerConfig {
    pub interval_secs: u64,
    /// Segments repaired concurrently.
    pub max_repair: usize,
    pub timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Extra pieces uploaded beyond the success threshold, as a fraction.
    pub max_excess_rate_optimal_threshold: f64,
}

impl Default for RepairerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_repair: 5,
            timeout_secs: 300,
            download_timeout_secs: 300,
            max_excess_rate_optimal_threshold: 0.05,
        }
    }
}

impl RepairerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Retries when recording audit outcomes in the overlay.
    pub max_retries_stat_db: u32,
    pub min_bytes_per_second: u64,
    pub min_download_timeout_secs: u64,
    /// Reverifications before a contained node is failed.
    pub max_reverify_count: u32,
    pub chore_interval_secs: u64,
    pub queue_interval_secs: u64,
    /// Segments sampled per node per chore pass.
    pub slots: usize,
    pub worker_concurrency: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_retries_stat_db: 0,
            min_bytes_per_second: 128,
            min_download_timeout_secs: 300,
            max_reverify_count: 3,
            chore_interval_secs: 30,
            queue_interval_secs: 3600,
            slots: 1,
            worker_concurrency: 1,
        }
    }
}

impl AuditConfig {
    pub fn chore_interval(&self) -> Duration {
        Duration::from_secs(self.chore_interval_secs)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_secs(self.queue_interval_secs)
    }

    pub fn min_download_timeout(&self) -> Duration {
        Duration::from_secs(self.min_download_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GarbageCollectionConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Skip the pass that would run immediately at startup.
    pub skip_first: bool,
    pub concurrent_sends: usize,
}

impl Default for GarbageCollectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5 * 24 * 3600,
            skip_first: true,
            concurrent_sends: 1,
        }
    }
}

impl GarbageCollectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbCleanupConfig {
    pub serials_interval_secs: u64,
}

impl Default for DbCleanupConfig {
    fn default() -> Self {
        Self {
            serials_interval_secs: 24 * 3600,
        }
    }
}

impl DbCleanupConfig {
    pub fn serials_interval(&self) -> Duration {
        Duration::from_secs(self.serials_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub interval_secs: u64,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self { interval_secs: 3600 }
    }
}

impl TallyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub interval_secs: u64,
    /// Per-project storage cap enforced through live accounting.
    pub max_alpha_usage_bytes: i64,
    /// Delete node tallies once they are rolled up.
    pub delete_tallies: bool,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 3600,
            max_alpha_usage_bytes: 25_000_000_000,
            delete_tallies: true,
        }
    }
}

impl RollupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Which billing backend the core wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingProvider {
    /// In-process accounts, no reconciliation chore.
    #[default]
    Mock,
    CoinPayments,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub provider: BillingProvider,
    pub coinpayments: CoinPaymentsConfig,
    /// Price per TB-month stored, in cents.
    pub storage_tb_price_cents: i64,
    /// Price per TB downloaded, in cents.
    pub egress_tb_price_cents: i64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            provider: BillingProvider::Mock,
            coinpayments: CoinPaymentsConfig::default(),
            storage_tb_price_cents: 1000,
            egress_tb_price_cents: 4500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinPaymentsConfig {
    pub public_key: String,
    pub private_key: String,
    pub transaction_update_interval_secs: u64,
    pub account_balance_update_interval_secs: u64,
}

impl Default for CoinPaymentsConfig {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            private_key: String::new(),
            transaction_update_interval_secs: 1800,
            account_balance_update_interval_secs: 1800,
        }
    }
}

impl CoinPaymentsConfig {
    pub fn transaction_update_interval(&self) -> Duration {
        Duration::from_secs(self.transaction_update_interval_secs)
    }

    pub fn account_balance_update_interval(&self) -> Duration {
        Duration::from_secs(self.account_balance_update_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GracefulExitConfig {
    pub enabled: bool,
    pub chore_interval_secs: u64,
    /// Transfer queue items written per batch.
    pub chore_batch_size: usize,
}

impl Default for GracefulExitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chore_interval_secs: 30,
            chore_batch_size: 500,
        }
    }
}

impl GracefulExitConfig {
    pub fn chore_interval(&self) -> Duration {
        Duration::from_secs(self.chore_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub chore_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            chore_interval_secs: 60,
        }
    }
}

impl MetricsConfig {
    pub fn chore_interval(&self) -> Duration {
        Duration::from_secs(self.chore_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DowntimeConfig {
    pub detection_interval_secs: u64,
}

impl Default for DowntimeConfig {
    fn default() -> Self {
        Self {
            detection_interval_secs: 3600,
        }
    }
}

impl DowntimeConfig {
    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs(self.detection_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Lowest acceptable running version; empty accepts anything.
    pub minimum_version: String,
    pub check_interval_secs: u64,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            minimum_version: String::new(),
            check_interval_secs: 900,
        }
    }
}

impl VersionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.graceful_exit.enabled);
        assert_eq!(config.payments.provider, BillingProvider::Mock);
        assert_eq!(config.server.peer_id_versions, "latest");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [graceful_exit]
            enabled = false

            [payments]
            provider = "coinpayments"

            [tally]
            interval_secs = 60
            "#,
        )
        .unwrap();

        assert!(!config.graceful_exit.enabled);
        assert_eq!(config.graceful_exit.chore_batch_size, 500);
        assert_eq!(config.payments.provider, BillingProvider::CoinPayments);
        assert_eq!(config.tally.interval(), Duration::from_secs(60));
        assert_eq!(config.rollup.interval_secs, 24 * 3600);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let result = Config::from_toml("[payments]\nprovider = \"stripe\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[contact]\nexternal_address = \"sat.example:7777\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.contact.external_address, "sat.example:7777");
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Config::from_file("/nonexistent/satellite.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/satellite.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SATELLITE_GRACEFUL_EXIT_ENABLED", "false"),
            ("SATELLITE_PAYMENTS_PROVIDER", "CoinPayments"),
            ("SATELLITE_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert!(!config.graceful_exit.enabled);
        assert_eq!(config.payments.provider, BillingProvider::CoinPayments);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let result = config.apply_vars(|key| {
            (key == "SATELLITE_GRACEFUL_EXIT_ENABLED").then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.tally.interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("tally.interval_secs"))
        ));
    }

    #[test]
    fn test_validate_rejects_ratio_out_of_range() {
        let mut config = Config::default();
        config.overlay.audit_disqualify_ratio = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { .. })));
    }
}
