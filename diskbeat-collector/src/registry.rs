//! Live probe registry
//!
//! Keyed by connection, never by probe identity: two connections reporting the
//! same identity are two entries. A connection is *pending* from accept until
//! its first decoded event, *active* afterwards, and forgotten on departure.
//! Owned by the aggregator alone.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

/// Remote address and port of a reporting connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub SocketAddr);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0.ip(), self.0.port())
    }
}

#[derive(Debug, Clone)]
struct ActiveProbe {
    probe_id: String,
    events: u64,
}

/// What an event did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// First event on this connection
    NewProbe {
        /// Other live connections already reporting the same identity
        shared_with: Vec<ConnectionId>,
    },
    Known,
    /// The connection reports an identity different from its first event
    IdentityChanged { previous: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    Removed { probe_id: String, events: u64 },
    /// Connected but never sent a decodable event
    Silent,
    /// Departure of a connection the registry never heard of
    Unknown,
}

#[derive(Debug, Default)]
pub struct ProbeRegistry {
    pending: HashSet<ConnectionId>,
    active: HashMap<ConnectionId, ActiveProbe>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&mut self, conn: ConnectionId) {
        if !self.active.contains_key(&conn) {
            self.pending.insert(conn);
        }
    }

    pub fn record_event(&mut self, conn: ConnectionId, probe_id: &str) -> Arrival {
        if let Some(entry) = self.active.get_mut(&conn) {
            entry.events += 1;
            if entry.probe_id != probe_id {
                return Arrival::IdentityChanged {
                    previous: entry.probe_id.clone(),
                };
            }
            return Arrival::Known;
        }

        self.pending.remove(&conn);
        let mut shared_with: Vec<ConnectionId> = self
            .active
            .iter()
            .filter(|(_, probe)| probe.probe_id == probe_id)
            .map(|(other, _)| *other)
            .collect();
        shared_with.sort_by_key(|c| c.0);
        self.active.insert(
            conn,
            ActiveProbe {
                probe_id: probe_id.to_string(),
                events: 1,
            },
        );
        Arrival::NewProbe { shared_with }
    }

    pub fn depart(&mut self, conn: ConnectionId) -> Departure {
        if let Some(probe) = self.active.remove(&conn) {
            return Departure::Removed {
                probe_id: probe.probe_id,
                events: probe.events,
            };
        }
        if self.pending.remove(&conn) {
            Departure::Silent
        } else {
            Departure::Unknown
        }
    }

    /// Connections that have sent at least one event and are still open
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Identity first reported by `conn`, if it is active
    pub fn probe_id(&self, conn: ConnectionId) -> Option<&str> {
        self.active.get(&conn).map(|p| p.probe_id.as_str())
    }
}
