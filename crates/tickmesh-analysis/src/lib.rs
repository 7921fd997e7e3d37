//! # tickmesh-analysis: reading and checking machine logs
//!
//! Machines write one JSON [`LogEntry`](tickmesh_types::LogEntry) per line to
//! `machine_<id>.log`. This crate reads a directory of those files and
//! produces:
//!
//! - [`ExperimentReport`]: per-machine event counts, drift, and queue
//!   statistics plus cluster-wide aggregates.
//! - [`VerificationReport`]: pass/fail [`CheckOutcome`]s for the rate limit,
//!   the Lamport clock rule, the connection pattern, and participation.

mod error;
mod reader;
mod stats;
mod verify;

pub use error::{AnalysisError, AnalysisResult};
pub use reader::{MachineLog, read_log_dir, read_log_file};
pub use stats::{DriftStats, ExperimentReport, GlobalStats, MachineStats, SenderDrift};
pub use verify::{
    CheckOutcome, VerificationReport, check_clock_rate, check_connections, check_logical_clock,
    check_participation, verify_logs,
};
