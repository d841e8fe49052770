//! Heartbeat publisher
//!
//! Sends `{"heartbeat": {"id", "time"}}` to the multicast group every
//! interval until shutdown. Send failures are logged and the loop carries on.

use chrono::Utc;
use diskbeat_protocol::{HeartbeatEvent, HeartbeatTime, MulticastSender};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

pub struct HeartbeatWorker {
    sender: MulticastSender,
    probe_id: String,
    every: Duration,
    shutdown: ShutdownSignal,
}

impl HeartbeatWorker {
    pub fn new(sender: MulticastSender, probe_id: String, every: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            sender,
            probe_id,
            every,
            shutdown,
        }
    }

    /// First beat carries a readable time, the following ones epoch seconds
    fn beat(&self, first: bool) -> HeartbeatEvent {
        let now = Utc::now();
        let time = if first {
            HeartbeatTime::Text(now.format("%a %b %e %H:%M:%S %Y").to_string())
        } else {
            HeartbeatTime::Epoch(now.timestamp_millis() as f64 / 1000.0)
        };
        HeartbeatEvent::new(self.probe_id.clone(), time)
    }

    /// Returns the number of heartbeats that reached the socket
    pub async fn run(self) -> u64 {
        info!("heartbeat to {} every {:?}", self.sender.target(), self.every);
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent: u64 = 0;
        let mut first = true;

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            let payload = match self.beat(first).encode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to encode heartbeat: {}", e);
                    continue;
                }
            };
            first = false;
            match self.sender.send(&payload).await {
                Ok(_) => {
                    sent += 1;
                    debug!("heartbeat {} sent", sent);
                }
                Err(e) => warn!(
                    "heartbeat send failed, check network interfaces: {}",
                    e
                ),
            }
        }

        info!("closing heartbeat socket after {} beats", sent);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskbeat_protocol::MulticastReceiver;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_heartbeats_until_shutdown() {
        let receiver = MulticastReceiver::join(Ipv4Addr::LOCALHOST, 0).await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let sender = MulticastSender::bind(Ipv4Addr::LOCALHOST, port, false).await.unwrap();
        let shutdown = ShutdownSignal::new();

        let worker = HeartbeatWorker::new(
            sender,
            "probe-1".into(),
            Duration::from_millis(50),
            shutdown.clone(),
        );
        let handle = tokio::spawn(worker.run());

        let (first, _) = tokio::time::timeout(Duration::from_secs(2), receiver.receive())
            .await
            .unwrap()
            .unwrap();
        let first = HeartbeatEvent::decode(&first).unwrap();
        assert_eq!(first.id, "probe-1");
        assert!(matches!(first.time, HeartbeatTime::Text(_)));

        let (second, _) = tokio::time::timeout(Duration::from_secs(2), receiver.receive())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            HeartbeatEvent::decode(&second).unwrap().time,
            HeartbeatTime::Epoch(_)
        ));

        shutdown.signal();
        let sent = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(sent >= 2);
    }
}
