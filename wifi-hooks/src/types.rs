// Shared value types

//! Shared data structures
//!
//! This module defines the value objects passed between probes, the event
//! monitor, and the dispatcher: the network observation snapshot and the
//! enums describing connection state and event provenance.

use std::fmt;
use std::time::SystemTime;

/// Perceived connectivity of the wireless link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Connecting,
    Disconnected,
    /// No probe strategy could produce an answer
    Unknown,
}

impl ConnectionState {
    /// Canonical lowercase name, as used in rule condition lists
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Unknown => "unknown",
        }
    }

    /// Parse a condition-list entry; `None` for unrecognized names
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ConnectionState::Connected),
            "connecting" => Some(ConnectionState::Connecting),
            "disconnected" => Some(ConnectionState::Disconnected),
            "unknown" => Some(ConnectionState::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which producer (and which kind of transition) an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Produced by the interval poll loop
    Poll,
    /// Push source reported a connection being established
    Connect,
    /// Push source reported a disconnect
    Disconnect,
    /// Network switched while staying connected (SSID changed)
    Change,
    /// Push source reported an established connection
    Push,
}

impl EventKind {
    /// Canonical lowercase name, as used in rule condition lists
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Poll => "poll",
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Change => "change",
            EventKind::Push => "push",
        }
    }

    /// Parse a condition-list entry; `None` for unrecognized names
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "poll" => Some(EventKind::Poll),
            "connect" => Some(EventKind::Connect),
            "disconnect" => Some(EventKind::Disconnect),
            "change" => Some(EventKind::Change),
            "push" => Some(EventKind::Push),
            _ => None,
        }
    }
}

/// A timestamped snapshot of perceived network connectivity
///
/// Produced by probes and the push event stream. Change identity is the
/// (ssid, state) pair only; signal, frequency, and address updates do not
/// make two observations distinct.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkObservation {
    pub ssid: Option<String>,
    pub interface: Option<String>,
    pub state: ConnectionState,
    pub ip_address: Option<String>,
    pub signal_dbm: Option<i32>,
    pub frequency: Option<String>,
    pub observed_at: SystemTime,
    pub kind: EventKind,
}

impl NetworkObservation {
    /// Observation with the given state and no further detail
    pub fn bare(state: ConnectionState, kind: EventKind) -> Self {
        Self {
            ssid: None,
            interface: None,
            state,
            ip_address: None,
            signal_dbm: None,
            frequency: None,
            observed_at: SystemTime::now(),
            kind,
        }
    }

    /// The comparable value when every probe strategy failed
    pub fn unknown() -> Self {
        Self::bare(ConnectionState::Unknown, EventKind::Poll)
    }

    /// The pair that defines whether two observations count as a change
    pub fn change_key(&self) -> (Option<&str>, ConnectionState) {
        (self.ssid.as_deref(), self.state)
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for NetworkObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ssid {
            Some(ssid) => write!(f, "{} ({})", ssid, self.state),
            None => f.write_str(self.state.as_str()),
        }
    }
}
