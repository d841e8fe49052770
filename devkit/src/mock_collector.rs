/*!
Mock collector for probe tests

Accepts any number of connections on an ephemeral loopback port and records
every decoded event per connection, in arrival order. Nothing is persisted.
*/

use anyhow::{bail, Result};
use diskbeat_protocol::{Frame, TelemetryCodec, TelemetryEvent};
use futures::StreamExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::FramedRead;

use crate::test_utils::wait_until;

/// What one client sent over its lifetime
#[derive(Debug, Clone)]
pub struct ConnectionLog {
    pub peer: SocketAddr,
    pub events: Vec<TelemetryEvent>,
    pub malformed: usize,
    /// The client closed its side (or the connection failed)
    pub closed: bool,
}

#[derive(Default)]
struct MockState {
    connections: Vec<ConnectionLog>,
    readers: Vec<AbortHandle>,
}

pub struct MockCollector {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
    acceptor: JoinHandle<()>,
}

impl MockCollector {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState::default()));
        let acceptor = tokio::spawn(accept_loop(listener, state.clone()));
        log::info!("[mock-collector] listening on {}", addr);
        Ok(Self {
            addr,
            state,
            acceptor,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// All events from all connections, connection by connection
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.state
            .lock()
            .connections
            .iter()
            .flat_map(|c| c.events.iter().cloned())
            .collect()
    }

    pub fn connections(&self) -> Vec<ConnectionLog> {
        self.state.lock().connections.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Waits until at least `count` events arrived and returns all of them
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Result<Vec<TelemetryEvent>> {
        if !wait_until(timeout, || self.events().len() >= count).await {
            bail!(
                "expected {} events within {:?}, got {}",
                count,
                timeout,
                self.events().len()
            );
        }
        Ok(self.events())
    }

    /// Waits until at least one client connected and every client closed
    pub async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        let all_closed = || {
            let state = self.state.lock();
            !state.connections.is_empty() && state.connections.iter().all(|c| c.closed)
        };
        if !wait_until(timeout, all_closed).await {
            bail!("connections still open after {:?}", timeout);
        }
        Ok(())
    }

    /// Stops accepting and drops every open connection, as a crashed collector would
    pub fn disconnect_all(&self) {
        self.acceptor.abort();
        let mut state = self.state.lock();
        for reader in state.readers.drain(..) {
            reader.abort();
        }
        log::info!("[mock-collector] dropped {} connections", state.connections.len());
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        self.acceptor.abort();
        for reader in self.state.lock().readers.drain(..) {
            reader.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<Mutex<MockState>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("[mock-collector] connection from {}", peer);
                let index = {
                    let mut state = state.lock();
                    state.connections.push(ConnectionLog {
                        peer,
                        events: Vec::new(),
                        malformed: 0,
                        closed: false,
                    });
                    state.connections.len() - 1
                };
                let reader = tokio::spawn(read_connection(stream, index, state.clone()));
                state.lock().readers.push(reader.abort_handle());
            }
            Err(e) => log::warn!("[mock-collector] accept failed: {}", e),
        }
    }
}

async fn read_connection(stream: TcpStream, index: usize, state: Arc<Mutex<MockState>>) {
    let mut frames = FramedRead::new(stream, TelemetryCodec::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Event(event)) => state.lock().connections[index].events.push(event),
            Ok(Frame::Malformed(e)) => {
                log::warn!("[mock-collector] malformed frame: {}", e);
                state.lock().connections[index].malformed += 1;
            }
            Err(e) => {
                log::warn!("[mock-collector] read failed: {}", e);
                break;
            }
        }
    }
    state.lock().connections[index].closed = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventBuilder, FakeProbe};

    #[tokio::test]
    async fn test_records_events_per_connection() {
        let collector = MockCollector::start().await.unwrap();
        let mut first = FakeProbe::connect(collector.addr()).await.unwrap();
        let mut second = FakeProbe::connect(collector.addr()).await.unwrap();

        let mut a = EventBuilder::new("a");
        let mut b = EventBuilder::new("b");
        first.send(&a.sample()).await.unwrap();
        second.send(&b.sample()).await.unwrap();
        second.send_raw(b"not json\n").await.unwrap();
        first.close().await.unwrap();
        second.close().await.unwrap();

        collector.wait_for_close(Duration::from_secs(2)).await.unwrap();
        let connections = collector.connections();
        assert_eq!(connections.len(), 2);
        let total: usize = connections.iter().map(|c| c.events.len()).sum();
        assert_eq!(total, 2);
        assert_eq!(connections.iter().map(|c| c.malformed).sum::<usize>(), 1);
    }
}
