//! Machine error types.

use std::io;

use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::registry::Rejection;

/// Result type for machine operations.
pub type MachineResult<T> = Result<T, MachineError>;

/// Errors that halt a machine's lifecycle.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The listening socket could not be bound.
    #[error("failed to bind to {addr} after {attempts} attempt(s): {source}")]
    Bind {
        addr: String,
        attempts: u32,
        source: io::Error,
    },

    /// I/O error outside of bind, dial, or send.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A lifecycle operation was called in the wrong state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// Settings that would make the machine misbehave.
    #[error("invalid machine settings: {0}")]
    InvalidSettings(String),
}

/// Dialing a peer failed. Recoverable: the peer stays unconnected.
#[derive(Debug, Error)]
pub enum DialError {
    /// Every attempt failed.
    #[error("gave up dialing port {port} after {attempts} attempt(s): {source}")]
    Exhausted {
        port: u16,
        attempts: u32,
        source: io::Error,
    },

    /// Stop was requested while dialing.
    #[error("dial to port {port} cancelled by shutdown")]
    Cancelled { port: u16 },

    /// The handshake line could not be written.
    #[error("handshake to port {port} failed: {source}")]
    Handshake { port: u16, source: io::Error },

    /// The connection opened but could not be registered.
    #[error("connection to port {port} not registered: {source}")]
    Register { port: u16, source: RegisterError },
}

impl DialError {
    /// Port that was being dialed.
    pub fn port(&self) -> u16 {
        match self {
            DialError::Exhausted { port, .. }
            | DialError::Cancelled { port }
            | DialError::Handshake { port, .. }
            | DialError::Register { port, .. } => *port,
        }
    }
}

/// Sending a message to a peer failed. Recoverable: the peer is dropped.
#[derive(Debug, Error)]
pub enum SendError {
    /// No live connection to the peer.
    #[error("no connection to port {0}")]
    NotConnected(u16),

    /// The write failed; the connection has been removed.
    #[error("write to port {port} failed: {source}")]
    Io { port: u16, source: io::Error },

    /// The message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An open stream could not be turned into a registered connection.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The port is not part of the topology.
    #[error("port {0} is not a known peer")]
    UnknownPeer(u16),

    #[error("{}", .0.reason())]
    Rejected(Rejection),

    /// Cloning the stream or starting its consumer failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
