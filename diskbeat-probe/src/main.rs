//! Diskbeat probe - disk throughput benchmark reporting to a collector
//!
//! - Writes files repeatedly and measures each write
//! - Streams samples and resource usage to the collector over one TCP connection
//! - Announces liveness with multicast heartbeats
//! - Stops after the configured run time or on Ctrl-C, then removes its files

mod app;
mod config;
mod connection;
mod heartbeat;
mod load;
mod reporting;
mod resources;
mod shutdown;

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ProbeConfig;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("diskbeat_probe=info")),
        )
        .init();

    info!("diskbeat probe starting");

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(async {
        let config = ProbeConfig::load().await.context("Failed to load configuration")?;
        app::run_probe(config).await
    });
    // A write stuck in the kernel must not keep the process alive
    runtime.shutdown_timeout(Duration::from_secs(1));

    let outcome = result?;
    info!(
        "probe {} done ({:?}): {} of {} samples sent, {} resource events, {} heartbeats",
        outcome.probe_id,
        outcome.report.reason,
        outcome.report.samples_sent,
        outcome.samples_produced,
        outcome.report.resources_sent,
        outcome.heartbeats_sent
    );
    if let Some(e) = outcome.load_error {
        warn!("load generation ended early: {}", e);
    }
    Ok(())
}
