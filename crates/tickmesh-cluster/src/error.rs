//! Error types for cluster management.

use std::time::Duration;
use thiserror::Error;
use tickmesh_machine::MachineError;
use tickmesh_types::MachineId;

/// Cluster management errors.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid machine count.
    #[error("Invalid machine count: {0} (must be >= 1)")]
    InvalidMachineCount(usize),

    /// Ports would run past 65535.
    #[error("Invalid port range: base={0}, machines={1}")]
    InvalidPortRange(u16, usize),

    /// Fixed clock rates do not match the machine count.
    #[error("Expected {expected} clock rates, got {actual}")]
    ClockRateCount { expected: usize, actual: usize },

    /// A machine failed to start or run.
    #[error("Machine {id} failed: {source}")]
    Machine { id: MachineId, source: MachineError },

    /// Machine not found.
    #[error("Machine {0} not found")]
    MachineNotFound(MachineId),

    /// Machine already running.
    #[error("Machine {0} is already running")]
    MachineAlreadyRunning(MachineId),

    /// Machine process failed to start.
    #[error("Machine {0} failed to start: {1}")]
    MachineStartFailed(MachineId, String),

    /// Process spawn error.
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    /// Machines did not reach the running state in time.
    #[error("Machines not running after {0:?}: {1:?}")]
    StartupTimeout(Duration, Vec<MachineId>),

    /// A machine thread panicked.
    #[error("Machine {0} thread panicked")]
    Panicked(MachineId),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
