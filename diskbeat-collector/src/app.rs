//! Collector orchestration
//!
//! Opens the store (taking its lock) and binds every socket before any task
//! starts, so setup failures surface as errors from [`Collector::start`].
//! Shutdown comes from the idle monitor or [`Collector::shutdown`]; the
//! aggregator always finishes what is already queued before the store closes.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acceptor::ConnectionAcceptor;
use crate::aggregator::{Aggregator, AggregatorMessage, AggregatorReport, AGGREGATION_QUEUE};
use crate::config::CollectorConfig;
use crate::heartbeat::{HeartbeatAggregator, LastSeen};
use crate::liveness::wait_for_idle;
use crate::store::{JsonlStore, ProbeStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No active probe for the idle grace period
    Idle,
    /// Operator interrupt
    Interrupted,
}

#[derive(Debug)]
pub struct CollectorReport {
    pub reason: StopReason,
    pub aggregator: AggregatorReport,
    pub heartbeats: BTreeMap<String, LastSeen>,
}

pub struct Collector {
    local_addr: SocketAddr,
    heartbeat_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<CollectorReport>>,
}

impl Collector {
    pub async fn start(config: CollectorConfig) -> Result<Self> {
        let store = JsonlStore::open(&config.store.path).context("failed to open probe store")?;
        Self::start_with_store(config, store).await
    }

    pub async fn start_with_store<S: ProbeStore>(config: CollectorConfig, store: S) -> Result<Self> {
        let listener = TcpListener::bind((config.listen.host.as_str(), config.listen.port))
            .await
            .with_context(|| format!("failed to listen on {}:{}", config.listen.host, config.listen.port))?;
        let local_addr = listener.local_addr()?;
        info!("accepting probe connections on {}", local_addr);

        let heartbeat = if config.heartbeat.enabled {
            let aggregator = HeartbeatAggregator::bind(config.heartbeat.group, config.heartbeat.port)
                .await
                .context("failed to open heartbeat socket")?;
            Some(aggregator)
        } else {
            info!("heartbeat listener disabled");
            None
        };
        let heartbeat_addr = match &heartbeat {
            Some(h) => Some(h.local_addr()?),
            None => None,
        };

        let shutdown = CancellationToken::new();
        let (aggregator_tx, aggregator_rx) = mpsc::channel(AGGREGATION_QUEUE);
        let (active_tx, active_rx) = watch::channel(0usize);

        let aggregator = tokio::spawn(Aggregator::new(store, active_tx).run(aggregator_rx));
        let acceptor = tokio::spawn(
            ConnectionAcceptor::new(listener, aggregator_tx.clone(), config.max_frame_len).run(),
        );
        let heartbeat = heartbeat.map(|h| tokio::spawn(h.run(shutdown.clone())));

        let task = tokio::spawn(supervise(
            shutdown.clone(),
            active_rx,
            config.idle_grace(),
            acceptor,
            aggregator_tx,
            aggregator,
            heartbeat,
        ));

        Ok(Self {
            local_addr,
            heartbeat_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn heartbeat_addr(&self) -> Option<SocketAddr> {
        self.heartbeat_addr
    }

    /// Requests an orderly shutdown, as an operator interrupt does
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn wait(self) -> Result<CollectorReport> {
        self.task.await.context("collector task failed")?
    }
}

async fn supervise<S: ProbeStore>(
    shutdown: CancellationToken,
    active: watch::Receiver<usize>,
    idle_grace: Duration,
    acceptor: JoinHandle<()>,
    aggregator_tx: mpsc::Sender<AggregatorMessage>,
    aggregator: JoinHandle<(S, AggregatorReport)>,
    heartbeat: Option<JoinHandle<BTreeMap<String, LastSeen>>>,
) -> Result<CollectorReport> {
    let reason = tokio::select! {
        _ = shutdown.cancelled() => StopReason::Interrupted,
        _ = wait_for_idle(active, idle_grace) => StopReason::Idle,
    };
    info!("collector shutting down ({:?})", reason);
    shutdown.cancel();

    // Readers go down with the acceptor that owns them
    acceptor.abort();
    let _ = acceptor.await;

    let _ = aggregator_tx.send(AggregatorMessage::Shutdown).await;
    drop(aggregator_tx);
    let (store, report) = aggregator.await.context("aggregator task failed")?;
    // Releases the store lock
    drop(store);

    let heartbeats = match heartbeat {
        Some(task) => task.await.unwrap_or_else(|e| {
            warn!("heartbeat listener failed: {}", e);
            BTreeMap::new()
        }),
        None => BTreeMap::new(),
    };

    Ok(CollectorReport {
        reason,
        aggregator: report,
        heartbeats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{list_probe_ids, read_record, record_path, StoreError};
    use diskbeat_devkit::{init_test_logging, EventBuilder, FakeProbe};
    use diskbeat_protocol::{Payload, TelemetryEvent};
    use std::path::Path;

    fn test_config(store: &Path) -> CollectorConfig {
        let mut config = CollectorConfig::default();
        config.listen.host = "127.0.0.1".to_string();
        config.listen.port = 0;
        config.heartbeat.enabled = false;
        config.store.path = store.to_path_buf();
        config.idle_grace_secs = 1;
        config
    }

    fn stored(dir: &Path, probe_id: &str) -> Vec<Payload> {
        read_record(&record_path(dir, probe_id))
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect()
    }

    fn payloads(events: &[TelemetryEvent]) -> Vec<Payload> {
        events.iter().map(|e| e.payload().clone()).collect()
    }

    #[tokio::test]
    async fn test_reference_sample_round_trip() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let collector = Collector::start(test_config(dir.path())).await.unwrap();

        let event = EventBuilder::reference_sample("probe-1");
        let mut probe = FakeProbe::connect(collector.local_addr()).await.unwrap();
        probe.send(&event).await.unwrap();
        probe.close().await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), collector.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.reason, StopReason::Idle);
        assert_eq!(report.aggregator.events_stored, 1);
        assert_eq!(stored(dir.path(), "probe-1"), vec![event.payload().clone()]);
    }

    #[tokio::test]
    async fn test_exits_when_no_probe_ever_connects() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let collector = Collector::start(test_config(dir.path())).await.unwrap();

        let report = collector.wait().await.unwrap();
        assert_eq!(report.reason, StopReason::Idle);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(report.aggregator.events_stored, 0);
        assert!(list_probe_ids(dir.path()).unwrap().is_empty());
        // Lock released on exit
        assert!(JsonlStore::open(dir.path()).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_probes_do_not_mix() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Collector::start(test_config(dir.path())).await.unwrap();
        let addr = collector.local_addr();

        let mut tasks = Vec::new();
        let mut expected = Vec::new();
        for name in ["probe-a", "probe-b", "probe-c"] {
            let mut builder = EventBuilder::new(name);
            let mut events = builder.samples(30);
            events.insert(10, builder.resource("5.0", "1.0"));
            expected.push((name, payloads(&events)));
            tasks.push(tokio::spawn(async move {
                let mut probe = FakeProbe::connect(addr).await.unwrap();
                for event in &events {
                    probe.send(event).await.unwrap();
                    tokio::task::yield_now().await;
                }
                probe.close().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let report = collector.wait().await.unwrap();
        assert_eq!(report.aggregator.events_stored, 93);
        for (name, payloads) in expected {
            assert_eq!(stored(dir.path(), name), payloads);
        }
        assert_eq!(list_probe_ids(dir.path()).unwrap(), vec!["probe-a", "probe-b", "probe-c"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_mid_stream_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Collector::start(test_config(dir.path())).await.unwrap();
        let mut builder = EventBuilder::new("probe-1");
        let first = builder.sample();
        let last = builder.sample();

        let mut probe = FakeProbe::connect(collector.local_addr()).await.unwrap();
        probe.send(&first).await.unwrap();
        probe.send_raw(b"{\"probe-1\": {\"operation_time\": \"fast\"}}\n").await.unwrap();
        probe.send_raw(b"}{ not json at all\n").await.unwrap();
        probe.send(&last).await.unwrap();
        probe.close().await.unwrap();

        collector.wait().await.unwrap();
        assert_eq!(stored(dir.path(), "probe-1"), payloads(&[first, last]));
    }

    #[tokio::test]
    async fn test_silent_connection_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Collector::start(test_config(dir.path())).await.unwrap();
        let probe = FakeProbe::connect(collector.local_addr()).await.unwrap();
        probe.close().await.unwrap();

        let report = collector.wait().await.unwrap();
        assert_eq!(report.aggregator.silent_connections, 1);
        assert!(list_probe_ids(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_identity_on_two_connections_shares_record() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Collector::start(test_config(dir.path())).await.unwrap();
        let mut builder = EventBuilder::new("probe-1");
        let batch_one = builder.samples(3);
        let batch_two = builder.samples(3);

        let mut first = FakeProbe::connect(collector.local_addr()).await.unwrap();
        let mut second = FakeProbe::connect(collector.local_addr()).await.unwrap();
        first.send_all(&batch_one).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        second.send_all(&batch_two).await.unwrap();
        first.close().await.unwrap();
        second.close().await.unwrap();

        let report = collector.wait().await.unwrap();
        assert_eq!(report.aggregator.events_stored, 6);
        assert_eq!(report.aggregator.probes_seen.len(), 1);
        let mut all = batch_one;
        all.extend(batch_two);
        assert_eq!(stored(dir.path(), "probe-1"), payloads(&all));
    }

    #[tokio::test]
    async fn test_heartbeats_are_logged_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.heartbeat.enabled = true;
        config.heartbeat.group = std::net::Ipv4Addr::LOCALHOST;
        config.heartbeat.port = 0;
        let collector = Collector::start(config).await.unwrap();
        let port = collector.heartbeat_addr().unwrap().port();

        let sender = diskbeat_protocol::MulticastSender::bind(std::net::Ipv4Addr::LOCALHOST, port, false)
            .await
            .unwrap();
        let probe = EventBuilder::new("probe-hb");
        sender.send(&probe.first_heartbeat().encode().unwrap()).await.unwrap();
        sender.send(&probe.heartbeat(1.0).encode().unwrap()).await.unwrap();

        // Heartbeats alone never keep the collector alive
        let report = collector.wait().await.unwrap();
        assert_eq!(report.reason, StopReason::Idle);
        assert_eq!(report.heartbeats["probe-hb"].count, 2);
        assert_eq!(report.aggregator.events_stored, 0);
        assert!(list_probe_ids(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let _held = JsonlStore::open(dir.path()).unwrap();

        let err = Collector::start(test_config(dir.path())).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Locked { .. })
        ));
    }

    #[tokio::test]
    async fn test_interrupt_stops_with_probe_connected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.idle_grace_secs = 60;
        let collector = Collector::start(config).await.unwrap();

        let mut builder = EventBuilder::new("probe-1");
        let mut probe = FakeProbe::connect(collector.local_addr()).await.unwrap();
        probe.send(&builder.sample()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        collector.shutdown();
        let report = tokio::time::timeout(Duration::from_secs(5), collector.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.reason, StopReason::Interrupted);
        assert_eq!(stored(dir.path(), "probe-1").len(), 1);
    }
}
