//! Diskbeat collector - aggregates probe telemetry into per-probe records
//!
//! - Accepts one reporting connection per probe and stores every event
//! - Logs multicast heartbeats separately from the reporting connections
//! - Exits once no probe has been active for the idle grace period, or on Ctrl-C

mod acceptor;
mod aggregator;
mod app;
mod config;
mod heartbeat;
mod liveness;
mod reader;
mod registry;
mod store;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::Collector;
use crate::config::CollectorConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("diskbeat_collector=info")),
        )
        .init();

    info!("diskbeat collector starting");

    let config = CollectorConfig::load().await.context("Failed to load configuration")?;
    let store_path = config.store.path.clone();
    let collector = Collector::start(config).await.context("Collector setup failed")?;

    let interrupt = collector.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("interrupt received");
                    interrupt.cancel();
                }
                Err(e) => warn!("cannot listen for interrupts: {}", e),
            },
            _ = interrupt.cancelled() => {}
        }
    });

    let report = collector.wait().await?;
    info!(
        "server shutting down ({:?}): {} events from {} probes, {} silent connections, {} probes heard by heartbeat",
        report.reason,
        report.aggregator.events_stored,
        report.aggregator.probes_seen.len(),
        report.aggregator.silent_connections,
        report.heartbeats.len()
    );

    for probe_id in store::list_probe_ids(&store_path)? {
        let entries = store::read_record(&store::record_path(&store_path, &probe_id))?;
        info!(probe = %probe_id, "{} stored entries", entries.len());
    }
    Ok(())
}
