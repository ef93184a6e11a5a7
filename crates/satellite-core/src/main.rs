//! # Satellite Core
//!
//! Runs the satellite's background subsystems until Ctrl+C.
//!
//! ## Startup Sequence
//!
//! 1. Parse the command line and load configuration (file, then environment)
//! 2. Initialize logging and optional trace export
//! 3. Derive the identity from `--identity-seed` or generate a fresh one
//! 4. Construct the core over in-memory repositories
//! 5. Run until Ctrl+C cancels the root token, then close

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use satellite_core::adapters::memory::{MemoryLiveAccounting, MemoryPointerDb, MemoryRevocationDb};
use satellite_core::adapters::MemoryRepositories;
use satellite_core::{Config, Core};
use satellite_telemetry::{init_telemetry, Monitor, TelemetryConfig};
use shared_types::{FullIdentity, VersionInfo};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "satellite-core", version, about = "Storage network satellite core")]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// 32-byte identity seed as hex.
    #[arg(long, value_name = "HEX")]
    identity_seed: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env().context("applying environment overrides")?;
    Ok(config)
}

fn load_identity(seed: Option<&str>) -> Result<FullIdentity> {
    let Some(seed) = seed else {
        warn!("No identity seed given, generating an ephemeral identity");
        return Ok(FullIdentity::generate());
    };
    let bytes = hex::decode(seed.trim()).context("identity seed is not hex")?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow::anyhow!("identity seed must be 32 bytes, got {}", bytes.len()))?;
    Ok(FullIdentity::from_seed(seed))
}

fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Some(chrono::Utc::now()),
        commit_hash: option_env!("SATELLITE_COMMIT").unwrap_or_default().to_string(),
        release: !cfg!(debug_assertions),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let telemetry = TelemetryConfig::from_env().with_log_level(config.log.level.clone());
    let telemetry = TelemetryConfig {
        json_logs: telemetry.json_logs || config.log.json,
        ..telemetry
    };
    let _guard = init_telemetry(telemetry).await.context("initializing telemetry")?;

    let identity = Arc::new(load_identity(args.identity_seed.as_deref())?);
    let monitor = Monitor::new().context("creating monitor")?;

    let core = Core::new(
        Arc::clone(&identity),
        Arc::new(MemoryRepositories::default()),
        Arc::new(MemoryPointerDb::default()),
        Arc::new(MemoryRevocationDb::default()),
        Arc::new(MemoryLiveAccounting::default()),
        version_info(),
        config,
        monitor.clone(),
    )?;
    info!(node_id = %core.id(), "Satellite core ready. Press Ctrl+C to stop.");

    let root = CancellationToken::new();
    let signal = root.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(err) => error!(error = %err, "Failed to listen for Ctrl+C, shutting down"),
        }
        signal.cancel();
    });

    let run_result = core.run(&root).await;
    root.cancel();

    if let Err(errors) = core.close() {
        for (subsystem, err) in errors.iter() {
            error!(subsystem, error = %err, "Close failed");
        }
    }

    match monitor.gather_text() {
        Ok(text) => tracing::debug!(metrics = %text, "Final metrics"),
        Err(err) => warn!(error = %err, "Failed to render metrics"),
    }

    run_result.context("satellite core stopped with an error")
}
