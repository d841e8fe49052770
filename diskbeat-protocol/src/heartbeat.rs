//! Liveness datagrams
//!
//! Wire shape: `{"heartbeat": {"id": "<probe>", "time": <string or epoch seconds>}}`.
//! Heartbeats are best effort and never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::DecodeError;

/// Heartbeat timestamp; probes send a readable string first, epoch seconds after
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeartbeatTime {
    Epoch(f64),
    Text(String),
}

impl fmt::Display for HeartbeatTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeartbeatTime::Epoch(secs) => write!(f, "{secs:.3}"),
            HeartbeatTime::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub id: String,
    pub time: HeartbeatTime,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    heartbeat: &'a HeartbeatEvent,
}

#[derive(Deserialize)]
struct Envelope {
    heartbeat: HeartbeatEvent,
}

impl HeartbeatEvent {
    pub fn new(id: impl Into<String>, time: HeartbeatTime) -> Self {
        Self {
            id: id.into(),
            time,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&EnvelopeRef { heartbeat: self })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.heartbeat.id.trim().is_empty() {
            return Err(DecodeError::EmptyIdentity);
        }
        Ok(envelope.heartbeat)
    }
}
