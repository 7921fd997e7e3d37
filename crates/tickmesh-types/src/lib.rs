//! # tickmesh-types: Core types for `tickmesh`
//!
//! This crate contains shared types used across the `tickmesh` system:
//! - Entity IDs ([`MachineId`])
//! - Logical time ([`LogicalTime`])
//! - Connection direction ([`Direction`])
//! - Event records emitted by machines ([`EventRecord`], [`EventKind`])
//! - Log file entries ([`LogEntry`])

use std::{
    fmt::{Debug, Display},
    num::NonZeroU32,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 4-byte values)
// ============================================================================

/// Identifier of a virtual machine within a run.
///
/// Machine IDs are 1-indexed ranks of the machine's listening port in the
/// sorted port set, so every machine computes the same label for every port.
/// Zero is not a valid ID and is rejected on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(NonZeroU32);

impl MachineId {
    /// The first machine ID.
    pub const FIRST: MachineId = MachineId(NonZeroU32::MIN);

    /// Creates a machine ID, returning `None` for zero.
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    /// Creates the machine ID for a 0-based rank in the sorted port set.
    ///
    /// ```
    /// # use tickmesh_types::MachineId;
    /// assert_eq!(MachineId::from_rank(0).get(), 1);
    /// assert_eq!(MachineId::from_rank(2).get(), 3);
    /// ```
    pub fn from_rank(rank: usize) -> Self {
        let rank = u32::try_from(rank).unwrap_or(u32::MAX);
        Self(NonZeroU32::MIN.saturating_add(rank))
    }

    /// Returns the numeric value.
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Name of this machine's JSON-lines log file, `machine_<id>.log`.
    pub fn log_file_name(self) -> String {
        format!("machine_{}.log", self.0)
    }

    /// Parses a log file name produced by [`MachineId::log_file_name`].
    pub fn from_log_file_name(name: &str) -> Option<Self> {
        let digits = name.strip_prefix("machine_")?.strip_suffix(".log")?;
        digits.parse::<u32>().ok().and_then(Self::new)
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for MachineId {
    type Error = InvalidMachineId;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidMachineId)
    }
}

impl From<MachineId> for u32 {
    fn from(id: MachineId) -> Self {
        id.get()
    }
}

/// Error returned when converting zero into a [`MachineId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidMachineId;

impl Display for InvalidMachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("machine id must be positive")
    }
}

impl std::error::Error for InvalidMachineId {}

// ============================================================================
// LogicalTime - Copy (Lamport clock value)
// ============================================================================

/// A Lamport logical clock value.
///
/// Serialized as a bare integer so it appears as `"clock": 3` on the wire
/// and in log files.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct LogicalTime(u64);

impl LogicalTime {
    pub const ZERO: LogicalTime = LogicalTime(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the value one tick later.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Number of ticks from `earlier` to `self`, saturating at zero.
    pub fn ticks_since(self, earlier: LogicalTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogicalTime> for u64 {
    fn from(time: LogicalTime) -> Self {
        time.0
    }
}

// ============================================================================
// Connection direction
// ============================================================================

/// Which side of a peer pair opened the connection.
///
/// For ports `a < b`, machine `a` always dials and machine `b` always accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// This machine dialed the peer.
    Dialed,
    /// This machine accepted the peer's dial.
    Accepted,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Dialed => f.write_str("dialed"),
            Direction::Accepted => f.write_str("accepted"),
        }
    }
}

// ============================================================================
// Event records
// ============================================================================

/// A structured record emitted by a machine.
///
/// Every processed cycle produces exactly one of [`EventRecord::Receive`],
/// [`EventRecord::Send`], or [`EventRecord::Internal`]. The remaining
/// variants describe lifecycle and connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventRecord {
    /// Machine finished binding and knows its rate and peers.
    Startup {
        port: u16,
        clock_rate: u32,
        peers: Vec<MachineId>,
    },

    /// A peer connection was registered.
    Connected {
        peer: MachineId,
        port: u16,
        direction: Direction,
    },

    /// Dialing a peer exhausted its retries.
    DialFailed { port: u16, attempts: u32 },

    /// A queued message was consumed and the clock observed it.
    Receive {
        sender: MachineId,
        old_clock: LogicalTime,
        sender_clock: LogicalTime,
        new_clock: LogicalTime,
        drift: u64,
        queue_length: usize,
    },

    /// The clock ticked and a message went to `targets`.
    ///
    /// `targets` lists only the peers whose write succeeded.
    Send {
        targets: Vec<MachineId>,
        new_clock: LogicalTime,
    },

    /// The clock ticked with no communication.
    Internal { new_clock: LogicalTime },

    /// The machine shut down.
    Stopped { final_clock: LogicalTime },
}

/// Discriminant of an [`EventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Startup,
    Connected,
    DialFailed,
    Receive,
    Send,
    Internal,
    Stopped,
}

impl EventRecord {
    pub fn kind(&self) -> EventKind {
        match self {
            EventRecord::Startup { .. } => EventKind::Startup,
            EventRecord::Connected { .. } => EventKind::Connected,
            EventRecord::DialFailed { .. } => EventKind::DialFailed,
            EventRecord::Receive { .. } => EventKind::Receive,
            EventRecord::Send { .. } => EventKind::Send,
            EventRecord::Internal { .. } => EventKind::Internal,
            EventRecord::Stopped { .. } => EventKind::Stopped,
        }
    }

    /// Returns true for records produced by a rate-limited cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::Receive | EventKind::Send | EventKind::Internal
        )
    }

    /// Clock value after the cycle, for cycle records.
    pub fn cycle_clock(&self) -> Option<LogicalTime> {
        match self {
            EventRecord::Receive { new_clock, .. }
            | EventRecord::Send { new_clock, .. }
            | EventRecord::Internal { new_clock } => Some(*new_clock),
            _ => None,
        }
    }
}

// ============================================================================
// Log entries
// ============================================================================

/// One line of a machine's log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Wall-clock time the record was written.
    pub timestamp: DateTime<Utc>,
    /// Machine that produced the record.
    pub machine: MachineId,
    /// The record itself.
    pub event: EventRecord,
}

impl LogEntry {
    /// Stamps a record with the current wall-clock time.
    pub fn now(machine: MachineId, event: EventRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            machine,
            event,
        }
    }
}

#[cfg(test)]
mod tests;
