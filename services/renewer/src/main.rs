//! Credential Renewer - Main Entry Point
//!
//! Loads configuration, starts renewal for the configured credential path
//! and runs until SIGTERM or Ctrl+C. SIGHUP forces a renewal.

use std::sync::Arc;

use anyhow::Context;
use rust_common::init_tracing;
use tracing::{debug, info};
use vault_renewal::RenewalEngine;

use credential_renewer::{ServiceConfig, SignalListener, run_until_shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.tracing())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        path = %config.vault.credential_path,
        sink = %config.sink_path.display(),
        "Starting credential renewer"
    );

    let engine = RenewalEngine::new(&config.vault)?;
    let signals = SignalListener::install().context("failed to install signal handlers")?;
    let handle = engine.spawn_default(Arc::new(config.sink()))?;

    run_until_shutdown(signals.into_stream(), handle, config.shutdown_timeout).await?;

    debug!(metrics = %engine.metrics().render(), "Final metrics");
    info!("Credential renewer stopped");
    Ok(())
}
