/**
 * AGGREGATOR - single consumer of the aggregation channel
 *
 * ROLE: drives each connection through Unknown -> Active -> Departed in the
 * probe registry and appends every decoded event to the record of the
 * identity embedded in the event. Nothing else touches the registry or the
 * store, so appends never race.
 *
 * REJECTION: an event failing validation is logged and counted, then
 * dropped before the registry sees it. The connection keeps its current
 * state and later events on it are handled normally.
 *
 * LIVENESS: the number of active connections is published on a watch channel
 * (only when it changes) for the idle monitor.
 */

use diskbeat_protocol::TelemetryEvent;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::registry::{Arrival, ConnectionId, Departure, ProbeRegistry};
use crate::store::ProbeStore;

/// Capacity of the channel between connection readers and the aggregator
pub const AGGREGATION_QUEUE: usize = 1024;

#[derive(Debug)]
pub enum AggregatorMessage {
    Connected(ConnectionId),
    Event(ConnectionId, TelemetryEvent),
    Departed(ConnectionId),
    /// Stop after everything queued before this message
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorReport {
    pub events_stored: u64,
    pub store_failures: u64,
    pub probes_seen: BTreeSet<String>,
    pub silent_connections: u64,
    /// Events dropped by validation
    pub rejected: u64,
}

pub struct Aggregator<S> {
    registry: ProbeRegistry,
    store: S,
    active: watch::Sender<usize>,
    report: AggregatorReport,
}

impl<S: ProbeStore> Aggregator<S> {
    pub fn new(store: S, active: watch::Sender<usize>) -> Self {
        Self {
            registry: ProbeRegistry::new(),
            store,
            active,
            report: AggregatorReport::default(),
        }
    }

    /// Consumes messages until `Shutdown` or until every sender is gone.
    /// Returns the store so callers can inspect it after the run.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<AggregatorMessage>) -> (S, AggregatorReport) {
        while let Some(message) = inbox.recv().await {
            match message {
                AggregatorMessage::Connected(conn) => {
                    debug!(peer = %conn, "connection opened");
                    self.registry.connected(conn);
                }
                AggregatorMessage::Event(conn, event) => self.on_event(conn, event),
                AggregatorMessage::Departed(conn) => self.on_departure(conn),
                AggregatorMessage::Shutdown => {
                    info!("aggregator stopping");
                    break;
                }
            }
            self.publish_active();
        }

        let Aggregator { store, report, .. } = self;
        info!(
            "aggregated {} events from {} probes ({} store failures, {} rejected)",
            report.events_stored,
            report.probes_seen.len(),
            report.store_failures,
            report.rejected
        );
        (store, report)
    }

    fn on_event(&mut self, conn: ConnectionId, event: TelemetryEvent) {
        if let Err(e) = event.validate() {
            self.report.rejected += 1;
            warn!(peer = %conn, "dropping {} event: {}", event.payload().kind(), e);
            return;
        }

        match self.registry.record_event(conn, event.probe_id()) {
            Arrival::NewProbe { shared_with } => {
                info!(peer = %conn, probe = %event.probe_id(), "new probe");
                if !shared_with.is_empty() {
                    let others: Vec<String> = shared_with.iter().map(|c| c.to_string()).collect();
                    warn!(
                        peer = %conn,
                        probe = %event.probe_id(),
                        "identity already reported by {}; records will interleave",
                        others.join(", ")
                    );
                }
                debug!("active probes: {}", self.registry.active_count());
            }
            Arrival::IdentityChanged { previous } => warn!(
                peer = %conn,
                "connection first reported {} but now sends events for {}",
                previous,
                event.probe_id()
            ),
            Arrival::Known => {}
        }

        let (probe_id, payload) = event.into_parts();
        match self.store.append(&probe_id, &payload) {
            Ok(()) => {
                self.report.events_stored += 1;
                self.report.probes_seen.insert(probe_id);
            }
            Err(e) => {
                self.report.store_failures += 1;
                error!(probe = %probe_id, "failed to store {} event: {}", payload.kind(), e);
            }
        }
    }

    fn on_departure(&mut self, conn: ConnectionId) {
        match self.registry.depart(conn) {
            Departure::Removed { probe_id, events } => {
                info!(peer = %conn, probe = %probe_id, "probe removed after {} events", events);
            }
            Departure::Silent => {
                self.report.silent_connections += 1;
                info!(peer = %conn, "client connected but never sent data");
            }
            Departure::Unknown => debug!(peer = %conn, "departure of unknown connection"),
        }
    }

    fn publish_active(&self) {
        let count = self.registry.active_count();
        self.active.send_if_modified(|current| {
            if *current == count {
                return false;
            }
            *current = count;
            true
        });
    }
}
