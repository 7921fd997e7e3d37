//! # tickmesh-cluster: cluster bootstrap and supervision
//!
//! Lays out a cluster as consecutive ports, derives per-machine settings
//! from configuration, and runs the machines either as threads in this
//! process ([`ClusterSupervisor`]) or as `tickmesh machine` child processes
//! ([`ProcessCluster`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::time::Duration;
//! use tickmesh_cluster::{ClusterPlan, ClusterSupervisor, log_sink};
//! use tickmesh_config::TickmeshConfig;
//!
//! let config = TickmeshConfig::default();
//! let plan = ClusterPlan::from_config(&config)?;
//! let settings = plan.settings(&config, &mut rand::thread_rng())?;
//! let dir = config.logging.directory.clone();
//! let mut cluster = ClusterSupervisor::new(settings, false, &move |id| log_sink(&dir, id))?;
//! cluster.run_for(Duration::from_secs(10), &AtomicBool::new(false))?;
//! # Ok::<(), tickmesh_cluster::Error>(())
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use tickmesh_machine::{EventSink, FanoutSink, JsonLinesSink, TracingSink};
use tickmesh_types::MachineId;

mod error;
mod plan;
mod process;
mod supervisor;

pub use error::{Error, Result};
pub use plan::{ClusterPlan, MachinePlan, machine_settings};
pub use process::{MachineProcess, ProcessCluster, ProcessSpec, ProcessStatus};
pub use supervisor::{ClusterSupervisor, MachineStatus, SinkFactory};

/// Standard sink for one machine: JSON lines under `dir` plus `tracing`.
pub fn log_sink(dir: &Path, machine: MachineId) -> io::Result<Arc<dyn EventSink>> {
    let file = JsonLinesSink::create(dir, machine)?;
    Ok(Arc::new(
        FanoutSink::new()
            .with(Arc::new(file))
            .with(Arc::new(TracingSink)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickmesh_types::EventRecord;

    #[test]
    fn test_log_sink_writes_machine_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = MachineId::new(2).unwrap();

        let sink = log_sink(dir.path(), id).unwrap();
        sink.emit(
            id,
            &EventRecord::Internal {
                new_clock: 1.into(),
            },
        );

        let contents = std::fs::read_to_string(dir.path().join("machine_2.log")).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"internal\""));
    }
}
