//! Heartbeat aggregator
//!
//! Listens on the multicast group and logs every heartbeat. Keeps the last
//! time each identity was heard from, for the shutdown summary only: this is
//! never fed into the probe registry or the idle monitor.

use diskbeat_protocol::{HeartbeatEvent, HeartbeatTime, MulticastReceiver};
use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct LastSeen {
    pub time: HeartbeatTime,
    pub received_at: OffsetDateTime,
    pub count: u64,
}

pub struct HeartbeatAggregator {
    receiver: MulticastReceiver,
    last_seen: BTreeMap<String, LastSeen>,
    malformed: u64,
}

impl HeartbeatAggregator {
    pub async fn bind(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        let receiver = MulticastReceiver::join(group, port).await?;
        info!("listening for heartbeats on {}:{}", group, port);
        Ok(Self {
            receiver,
            last_seen: BTreeMap::new(),
            malformed: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.receiver.local_addr()
    }

    /// Runs until `shutdown` is cancelled, then returns the last-seen table
    pub async fn run(mut self, shutdown: CancellationToken) -> BTreeMap<String, LastSeen> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.receiver.receive() => match received {
                    Ok((bytes, from)) => self.on_datagram(&bytes, from),
                    Err(e) => warn!("heartbeat receive failed: {}", e),
                }
            }
        }

        for (id, seen) in &self.last_seen {
            info!(
                probe = %id,
                "{} heartbeats, last sent at {} (received {})",
                seen.count, seen.time, seen.received_at
            );
        }
        if self.malformed > 0 {
            warn!("{} malformed heartbeats ignored", self.malformed);
        }
        self.last_seen
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        match HeartbeatEvent::decode(bytes) {
            Ok(beat) => {
                debug!(probe = %beat.id, "heartbeat from {} at {}", from, beat.time);
                let received_at = OffsetDateTime::now_utc();
                self.last_seen
                    .entry(beat.id)
                    .and_modify(|seen| {
                        seen.time = beat.time.clone();
                        seen.received_at = received_at;
                        seen.count += 1;
                    })
                    .or_insert(LastSeen {
                        time: beat.time,
                        received_at,
                        count: 1,
                    });
            }
            Err(e) => {
                self.malformed += 1;
                warn!("malformed heartbeat from {}: {}", from, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskbeat_devkit::EventBuilder;
    use diskbeat_protocol::MulticastSender;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tracks_last_seen_per_identity() {
        let aggregator = HeartbeatAggregator::bind(Ipv4Addr::LOCALHOST, 0).await.unwrap();
        let port = aggregator.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(aggregator.run(shutdown.clone()));

        let sender = MulticastSender::bind(Ipv4Addr::LOCALHOST, port, false).await.unwrap();
        let probe = EventBuilder::new("probe-1");
        sender.send(&probe.first_heartbeat().encode().unwrap()).await.unwrap();
        sender.send(&probe.heartbeat(1_700_000_000.5).encode().unwrap()).await.unwrap();
        sender.send(b"{\"heartbeat\": {}}").await.unwrap();
        sender
            .send(&EventBuilder::new("probe-2").heartbeat(1.0).encode().unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        let table = task.await.unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table["probe-1"].count, 2);
        assert_eq!(table["probe-1"].time, HeartbeatTime::Epoch(1_700_000_000.5));
        assert_eq!(table["probe-2"].count, 1);
    }
}
