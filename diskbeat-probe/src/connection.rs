//! The probe's single reporting connection
//!
//! Opened once at startup and never re-established: a refused connection
//! aborts the probe, a failed write ends it.

use diskbeat_protocol::{CodecError, TelemetryCodec, TelemetryEvent};
use futures::SinkExt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to collector {addr} cannot be established: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connection to collector {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("collector connection failed: {0}")]
    Send(#[from] CodecError),
}

pub struct ProbeConnection {
    writer: FramedWrite<TcpStream, TelemetryCodec>,
    peer: SocketAddr,
    sent: u64,
}

impl ProbeConnection {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectionError> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Err(_) => return Err(ConnectionError::ConnectTimeout { addr, timeout }),
            Ok(Err(source)) => return Err(ConnectionError::Connect { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        let peer = stream
            .peer_addr()
            .map_err(|source| ConnectionError::Connect { addr, source })?;
        // Frames are small and latency matters more than batching
        stream.set_nodelay(true).ok();
        info!("connected to collector at {}", peer);

        Ok(Self {
            writer: FramedWrite::new(stream, TelemetryCodec::new()),
            peer,
            sent: 0,
        })
    }

    /// Writes and flushes one event
    pub async fn send(&mut self, event: &TelemetryEvent) -> Result<(), ConnectionError> {
        self.writer.send(event).await?;
        self.sent += 1;
        Ok(())
    }

    /// Flushes and shuts down the write half
    pub async fn close(mut self) -> Result<(), ConnectionError> {
        SinkExt::<&TelemetryEvent>::close(&mut self.writer).await?;
        info!("closed collector connection after {} events", self.sent);
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}
