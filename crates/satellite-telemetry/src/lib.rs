//! # Satellite Telemetry
//!
//! Observability for the satellite core.
//!
//! ## Components
//!
//! - **Logs**: `tracing` subscriber with env filter, pretty or JSON console output
//! - **Traces**: optional OpenTelemetry export over OTLP
//! - **Metrics**: `Monitor`, a caller-owned prometheus registry for subsystem lifecycle counters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use satellite_telemetry::{init_telemetry, Monitor, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).await.expect("telemetry");
//!     let monitor = Monitor::new().expect("monitor");
//!     // pass `monitor` to whatever records into it
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset | OTLP endpoint; no export when unset |
//! | `OTEL_SERVICE_NAME` | `satellite-core` | Service name in traces |
//! | `SATELLITE_LOG_LEVEL` | `info` | Log level filter |
//! | `SATELLITE_JSON_LOGS` | `false` | JSON console output |

mod config;
mod monitor;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use monitor::Monitor;
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize tracing: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and, if configured, trace export.
///
/// Returns a guard that must be held for the lifetime of the application.
/// When dropped, it flushes pending spans.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let tracing_guard = tracing_setup::init_tracing(&config).await?;

    Ok(TelemetryGuard {
        _tracing: tracing_guard,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
