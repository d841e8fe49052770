//! Probe orchestration
//!
//! Startup order matters: configuration is validated before any socket is
//! opened, and a collector that cannot be reached ends the run before the
//! load worker writes a single file.

use anyhow::{Context, Result};
use diskbeat_protocol::MulticastSender;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ProbeConfig;
use crate::connection::ProbeConnection;
use crate::heartbeat::HeartbeatWorker;
use crate::load::{build_generator, LoadWorker};
use crate::reporting::{ReportSummary, ReportTiming, ReportingLoop};
use crate::resources::ProcessSampler;
use crate::shutdown::ShutdownSignal;

#[derive(Debug)]
pub struct ProbeOutcome {
    pub probe_id: String,
    pub report: ReportSummary,
    pub samples_produced: u64,
    /// Set when the load worker stopped on its own. Logged, never fatal.
    pub load_error: Option<String>,
    pub heartbeats_sent: u64,
}

pub async fn run_probe(mut config: ProbeConfig) -> Result<ProbeOutcome> {
    config.validate().context("invalid probe configuration")?;
    let probe_id = config.resolve_identity();
    info!("starting probe {}", probe_id);

    let connection = ProbeConnection::connect(
        &config.collector.host,
        config.collector.port,
        config.collector.connect_timeout(),
    )
    .await?;

    let heartbeat_sender = MulticastSender::bind(
        config.heartbeat.group,
        config.heartbeat.port,
        config.heartbeat.multicast_loop,
    )
    .await
    .context("failed to open heartbeat socket")?;

    let shutdown = ShutdownSignal::new();
    let (sample_tx, sample_rx) = mpsc::unbounded_channel();

    let load_worker = LoadWorker::new(
        build_generator(&config.load),
        config.load.clone(),
        config.load.chunk_dir(&probe_id),
        sample_tx,
        shutdown.clone(),
    );
    let load_task = tokio::spawn(load_worker.run());

    let heartbeat_task = tokio::spawn(
        HeartbeatWorker::new(
            heartbeat_sender,
            probe_id.clone(),
            config.heartbeat_interval(),
            shutdown.clone(),
        )
        .run(),
    );

    let interrupt_task = spawn_interrupt_listener(shutdown.clone());

    let timing = ReportTiming {
        run_time: config.run_time(),
        resource_interval: config.resource_interval(),
        drain_timeout: config.drain_timeout(),
    };
    let report = ReportingLoop::new(
        probe_id.clone(),
        connection,
        sample_rx,
        ProcessSampler::current(),
        shutdown.clone(),
        timing,
    )
    .run()
    .await;
    interrupt_task.abort();

    let (samples_produced, load_error) = match load_task.await {
        Ok(Ok(count)) => (count, None),
        Ok(Err(e)) => {
            error!("load generator stopped: {}", e);
            (0, Some(e.to_string()))
        }
        Err(e) => {
            error!("load worker task failed: {}", e);
            (0, Some(e.to_string()))
        }
    };

    let heartbeats_sent = match heartbeat_task.await {
        Ok(count) => count,
        Err(e) => {
            warn!("heartbeat task failed: {}", e);
            0
        }
    };

    info!(
        "probe {} finished: {} samples produced, {} heartbeats",
        probe_id, samples_produced, heartbeats_sent
    );
    Ok(ProbeOutcome {
        probe_id,
        report,
        samples_produced,
        load_error,
        heartbeats_sent,
    })
}

fn spawn_interrupt_listener(shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    shutdown.signal();
                }
                Err(e) => warn!("cannot listen for interrupts: {}", e),
            },
            _ = shutdown.wait() => {}
        }
    })
}
