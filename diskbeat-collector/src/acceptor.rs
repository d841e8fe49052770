//! Connection acceptor
//!
//! Accepts reporting connections forever and hands each one to its own
//! reader task. Accept errors are logged and accepting continues. Readers
//! live in a `JoinSet` owned by the acceptor, so aborting the acceptor
//! drops every open connection with it.

use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::aggregator::AggregatorMessage;
use crate::reader::{ConnectionReader, ReaderStats};
use crate::registry::ConnectionId;

pub struct ConnectionAcceptor {
    listener: TcpListener,
    aggregator: mpsc::Sender<AggregatorMessage>,
    max_frame_len: usize,
}

impl ConnectionAcceptor {
    pub fn new(listener: TcpListener, aggregator: mpsc::Sender<AggregatorMessage>, max_frame_len: usize) -> Self {
        Self {
            listener,
            aggregator,
            max_frame_len,
        }
    }

    pub async fn run(self) {
        let mut readers: JoinSet<ReaderStats> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = ConnectionId(peer);
                        info!(peer = %conn, "connection accepted");
                        if self.aggregator.send(AggregatorMessage::Connected(conn)).await.is_err() {
                            debug!("aggregator gone, acceptor stopping");
                            return;
                        }
                        let reader = ConnectionReader::new(conn, stream, self.max_frame_len, self.aggregator.clone());
                        readers.spawn(reader.run());
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        // Typically fd exhaustion; back off instead of spinning
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(finished) = readers.join_next(), if !readers.is_empty() => {
                    if let Err(e) = finished {
                        warn!("connection reader failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskbeat_devkit::{EventBuilder, FakeProbe};
    use diskbeat_protocol::DEFAULT_MAX_FRAME_LEN;

    #[tokio::test]
    async fn test_accepts_while_other_connections_stay_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let acceptor = tokio::spawn(ConnectionAcceptor::new(listener, tx, DEFAULT_MAX_FRAME_LEN).run());

        // First connection stays open and silent the whole time
        let _idle = FakeProbe::connect(addr).await.unwrap();
        let mut busy = FakeProbe::connect(addr).await.unwrap();
        busy.send(&EventBuilder::new("probe-2").sample()).await.unwrap();
        busy.close().await.unwrap();

        let mut connected = 0;
        let mut events = 0;
        let mut departed = 0;
        while departed == 0 {
            let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match message {
                AggregatorMessage::Connected(_) => connected += 1,
                AggregatorMessage::Event(_, e) => {
                    assert_eq!(e.probe_id(), "probe-2");
                    events += 1;
                }
                AggregatorMessage::Departed(_) => departed += 1,
                AggregatorMessage::Shutdown => unreachable!(),
            }
        }
        assert_eq!(connected, 2);
        assert_eq!(events, 1);
        acceptor.abort();
    }
}
