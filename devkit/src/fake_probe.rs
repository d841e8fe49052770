/*!
Scripted probe client for collector tests

Sends well-formed frames through the real codec, or arbitrary bytes to
exercise the collector's handling of broken input.
*/

use anyhow::Result;
use diskbeat_protocol::{encode_frame, TelemetryEvent};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub struct FakeProbe {
    stream: TcpStream,
}

impl FakeProbe {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, event: &TelemetryEvent) -> Result<()> {
        let frame = encode_frame(event)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    pub async fn send_all(&mut self, events: &[TelemetryEvent]) -> Result<()> {
        for event in events {
            self.send(event).await?;
        }
        Ok(())
    }

    /// Writes bytes as-is: partial frames, garbage, several frames at once
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Shuts down the write half so the collector sees end of stream
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
