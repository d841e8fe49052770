//! Reporting loop
//!
//! Owns the collector connection. Forwards every sample from the load worker,
//! interleaves periodic resource events, enforces the run deadline and, once
//! shutdown is set, drains what the load worker still has in flight.

use diskbeat_protocol::{Sample, TelemetryEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionError, ProbeConnection};
use crate::resources::ResourceSampler;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured run time elapsed
    Deadline,
    /// Shutdown was set elsewhere (operator interrupt)
    Interrupted,
    /// The load worker stopped producing and closed its channel
    LoadFinished,
    /// A write to the collector failed
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSummary {
    pub reason: StopReason,
    pub samples_sent: u64,
    pub resources_sent: u64,
    pub drained: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ReportTiming {
    pub run_time: Duration,
    pub resource_interval: Duration,
    pub drain_timeout: Duration,
}

pub struct ReportingLoop<S> {
    probe_id: String,
    connection: ProbeConnection,
    samples: mpsc::UnboundedReceiver<Sample>,
    sampler: S,
    shutdown: ShutdownSignal,
    timing: ReportTiming,
}

impl<S: ResourceSampler> ReportingLoop<S> {
    pub fn new(
        probe_id: String,
        connection: ProbeConnection,
        samples: mpsc::UnboundedReceiver<Sample>,
        sampler: S,
        shutdown: ShutdownSignal,
        timing: ReportTiming,
    ) -> Self {
        Self {
            probe_id,
            connection,
            samples,
            sampler,
            shutdown,
            timing,
        }
    }

    pub async fn run(self) -> ReportSummary {
        let ReportingLoop {
            probe_id,
            mut connection,
            mut samples,
            mut sampler,
            shutdown,
            timing,
        } = self;

        let deadline = tokio::time::sleep(timing.run_time);
        tokio::pin!(deadline);
        let mut resource_tick = interval_at(Instant::now() + timing.resource_interval, timing.resource_interval);
        resource_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut summary = ReportSummary {
            reason: StopReason::Interrupted,
            samples_sent: 0,
            resources_sent: 0,
            drained: 0,
        };

        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    info!("run time of {:?} elapsed, shutting down", timing.run_time);
                    break StopReason::Deadline;
                }
                _ = shutdown.wait() => break StopReason::Interrupted,
                sample = samples.recv() => {
                    let Some(sample) = sample else {
                        warn!("load worker stopped producing samples");
                        break StopReason::LoadFinished;
                    };
                    if let Err(e) = forward_sample(&mut connection, &probe_id, sample).await {
                        error!("lost connection to collector: {}", e);
                        break StopReason::ConnectionLost;
                    }
                    summary.samples_sent += 1;
                }
                _ = resource_tick.tick() => {
                    let Some(resource) = sampler.sample() else {
                        continue;
                    };
                    debug!("resource usage cpu={}% mem={}%", resource.cpu, resource.mem);
                    let event = TelemetryEvent::resource(probe_id.as_str(), resource);
                    if let Err(e) = connection.send(&event).await {
                        error!("lost connection to collector: {}", e);
                        break StopReason::ConnectionLost;
                    }
                    summary.resources_sent += 1;
                }
            }
        };
        summary.reason = reason;
        shutdown.signal();

        if reason != StopReason::ConnectionLost {
            match drain(&mut connection, &probe_id, &mut samples, timing.drain_timeout).await {
                Ok(count) => summary.drained = count,
                Err(e) => {
                    error!("lost connection to collector while draining: {}", e);
                    summary.reason = StopReason::ConnectionLost;
                }
            }
        }
        summary.samples_sent += summary.drained;

        if summary.reason != StopReason::ConnectionLost {
            if let Err(e) = connection.close().await {
                warn!("failed to close collector connection cleanly: {}", e);
            }
        }
        info!(
            "reporting stopped ({:?}): {} samples, {} resource events",
            summary.reason, summary.samples_sent, summary.resources_sent
        );
        summary
    }
}

async fn forward_sample(
    connection: &mut ProbeConnection,
    probe_id: &str,
    sample: Sample,
) -> Result<(), ConnectionError> {
    debug!("{} bytes in {:.3}s ({})", sample.file_size, sample.operation_time, sample.write_speed);
    connection.send(&TelemetryEvent::sample(probe_id, sample)).await
}

/// Forwards samples still in flight until the load worker closes its channel
/// or nothing arrives for `quiet`
async fn drain(
    connection: &mut ProbeConnection,
    probe_id: &str,
    samples: &mut mpsc::UnboundedReceiver<Sample>,
    quiet: Duration,
) -> Result<u64, ConnectionError> {
    let mut drained = 0;
    loop {
        match tokio::time::timeout(quiet, samples.recv()).await {
            Ok(Some(sample)) => {
                forward_sample(connection, probe_id, sample).await?;
                drained += 1;
            }
            Ok(None) => break,
            Err(_) => {
                debug!("no sample within {:?}, giving up on the drain", quiet);
                break;
            }
        }
    }
    Ok(drained)
}
