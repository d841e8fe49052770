//! Per-connection reader
//!
//! Turns the byte stream of one reporting connection into frames and forwards
//! decoded events to the aggregator. A malformed frame is logged and skipped;
//! the rest of the stream is still read. End of stream or a read error ends
//! the reader with a departure marker.

use diskbeat_protocol::{Frame, TelemetryCodec};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::aggregator::AggregatorMessage;
use crate::registry::ConnectionId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub events: u64,
    pub malformed: u64,
}

pub struct ConnectionReader {
    conn: ConnectionId,
    frames: FramedRead<TcpStream, TelemetryCodec>,
    aggregator: mpsc::Sender<AggregatorMessage>,
}

impl ConnectionReader {
    pub fn new(
        conn: ConnectionId,
        stream: TcpStream,
        max_frame_len: usize,
        aggregator: mpsc::Sender<AggregatorMessage>,
    ) -> Self {
        Self {
            conn,
            frames: FramedRead::new(stream, TelemetryCodec::with_max_frame_len(max_frame_len)),
            aggregator,
        }
    }

    pub async fn run(mut self) -> ReaderStats {
        let conn = self.conn;
        let mut stats = ReaderStats::default();

        while let Some(frame) = self.frames.next().await {
            match frame {
                Ok(Frame::Event(event)) => {
                    debug!(peer = %conn, "message received: {}", event.to_json());
                    stats.events += 1;
                    if self.aggregator.send(AggregatorMessage::Event(conn, event)).await.is_err() {
                        debug!(peer = %conn, "aggregator gone, dropping connection");
                        return stats;
                    }
                }
                Ok(Frame::Malformed(e)) => {
                    stats.malformed += 1;
                    warn!(peer = %conn, "dropping malformed frame: {}", e);
                }
                Err(e) => {
                    warn!(peer = %conn, "read failed: {}", e);
                    break;
                }
            }
        }

        debug!(
            peer = %conn,
            "stream closed after {} events ({} malformed)",
            stats.events, stats.malformed
        );
        let _ = self.aggregator.send(AggregatorMessage::Departed(conn)).await;
        stats
    }
}
