//! Multi-process clusters: one `tickmesh machine` child per machine.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tickmesh_types::MachineId;
use tracing::{debug, info, warn};

use crate::{ClusterPlan, Error, MachinePlan, Result};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Status of a machine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Not running.
    Stopped,

    /// Spawned, not yet confirmed alive.
    Starting,

    /// Running normally.
    Running,

    /// Exited without being asked to.
    Crashed,
}

/// How to launch a machine process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable to run, normally the `tickmesh` binary itself.
    pub program: PathBuf,
    /// Arguments placed before the generated `machine ...` arguments.
    pub leading_args: Vec<String>,
    /// Extra environment variables for every child.
    pub env: Vec<(String, String)>,
    pub host: String,
    pub log_dir: Option<PathBuf>,
    /// Base seed; machine `i` gets `seed + i`.
    pub seed: Option<u64>,
    /// How long a child must survive after spawning to count as running.
    pub startup_grace: Duration,
    /// Pause between consecutive spawns.
    pub spawn_gap: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            env: Vec::new(),
            host: "127.0.0.1".to_string(),
            log_dir: None,
            seed: None,
            startup_grace: Duration::from_millis(200),
            spawn_gap: Duration::from_millis(100),
        }
    }

    /// Spec that re-runs the current executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments for one machine's `tickmesh machine` invocation.
    pub fn machine_args(&self, plan: &MachinePlan, rank: usize, clock_rate: u32) -> Vec<String> {
        let peers = plan
            .peers
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut args = self.leading_args.clone();
        args.extend([
            "machine".to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            plan.port.to_string(),
            "--peers".to_string(),
            peers,
            "--clock-rate".to_string(),
            clock_rate.to_string(),
        ]);
        if let Some(dir) = &self.log_dir {
            args.push("--log-dir".to_string());
            args.push(dir.display().to_string());
        }
        if let Some(seed) = self.seed {
            args.push("--seed".to_string());
            args.push(seed.wrapping_add(rank as u64).to_string());
        }
        args
    }
}

/// A managed machine process.
pub struct MachineProcess {
    pub plan: MachinePlan,
    pub clock_rate: u32,
    pub process: Option<Child>,
    pub status: ProcessStatus,
}

impl MachineProcess {
    /// Creates a machine process (not started).
    pub fn new(plan: MachinePlan, clock_rate: u32) -> Self {
        Self {
            plan,
            clock_rate,
            process: None,
            status: ProcessStatus::Stopped,
        }
    }

    pub fn id(&self) -> MachineId {
        self.plan.id
    }

    pub fn port(&self) -> u16 {
        self.plan.port
    }

    /// Spawns the child and waits out the startup grace period.
    pub fn start(&mut self, spec: &ProcessSpec, rank: usize) -> Result<()> {
        if matches!(self.status, ProcessStatus::Starting | ProcessStatus::Running) {
            return Err(Error::MachineAlreadyRunning(self.id()));
        }

        self.status = ProcessStatus::Starting;
        let args = spec.machine_args(&self.plan, rank, self.clock_rate);
        debug!(machine = %self.id(), program = %spec.program.display(), ?args, "spawning");

        let child = Command::new(&spec.program)
            .args(&args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                self.status = ProcessStatus::Crashed;
                Error::SpawnError(e.to_string())
            })?;
        self.process = Some(child);

        thread::sleep(spec.startup_grace);

        if self.is_alive() {
            self.status = ProcessStatus::Running;
            info!(machine = %self.id(), port = self.port(), clock_rate = self.clock_rate, "machine process running");
            Ok(())
        } else {
            self.status = ProcessStatus::Crashed;
            Err(Error::MachineStartFailed(
                self.id(),
                "process exited immediately".to_string(),
            ))
        }
    }

    /// Kills the child and waits up to `timeout` for it to exit.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(mut child) = self.process.take() else {
            if self.status != ProcessStatus::Crashed {
                self.status = ProcessStatus::Stopped;
            }
            return Ok(());
        };

        // Fails only if the child already exited.
        let _ = child.kill();

        let deadline = Instant::now() + timeout;
        let result = loop {
            match child.try_wait() {
                Ok(Some(_)) => break Ok(()),
                Ok(None) if Instant::now() >= deadline => {
                    warn!(machine = %self.id(), "process did not exit after kill");
                    break Ok(());
                }
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(e) => break Err(Error::Io(e)),
            }
        };

        self.status = ProcessStatus::Stopped;
        result
    }

    /// Checks whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.process.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_)) | Err(_)) | None => false,
        }
    }

    /// Marks a running child that has exited as crashed. Returns true on
    /// that transition.
    pub fn check(&mut self) -> bool {
        if self.status == ProcessStatus::Running && !self.is_alive() {
            self.status = ProcessStatus::Crashed;
            self.process = None;
            return true;
        }
        false
    }
}

impl std::fmt::Debug for MachineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineProcess")
            .field("id", &self.plan.id)
            .field("port", &self.plan.port)
            .field("status", &self.status)
            .finish()
    }
}

/// Supervises one child process per machine.
#[derive(Debug)]
pub struct ProcessCluster {
    spec: ProcessSpec,
    processes: Vec<MachineProcess>,
}

impl ProcessCluster {
    /// Pairs each planned machine with its clock rate.
    pub fn new(plan: &ClusterPlan, clock_rates: &[u32], spec: ProcessSpec) -> Result<Self> {
        if clock_rates.len() != plan.len() {
            return Err(Error::ClockRateCount {
                expected: plan.len(),
                actual: clock_rates.len(),
            });
        }
        let processes = plan
            .machines
            .iter()
            .cloned()
            .zip(clock_rates.iter().copied())
            .map(|(m, rate)| MachineProcess::new(m, rate))
            .collect();
        Ok(Self { spec, processes })
    }

    /// Spawns every machine, highest id first, so listeners on higher ports
    /// come up before the lower machines dial them.
    pub fn start_all(&mut self) -> Result<()> {
        let count = self.processes.len();
        for rank in (0..count).rev() {
            if let Err(e) = self.processes[rank].start(&self.spec, rank) {
                warn!(error = %e, "process cluster startup failed");
                if let Err(stop_err) = self.stop_all() {
                    warn!(error = %stop_err, "cleanup after failed startup");
                }
                return Err(e);
            }
            if rank > 0 {
                thread::sleep(self.spec.spawn_gap);
            }
        }
        info!(machines = count, "process cluster started");
        Ok(())
    }

    /// Kills every child and waits for each to exit.
    pub fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for process in &mut self.processes {
            if let Err(e) = process.stop(STOP_TIMEOUT) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the machines whose processes exited since the last check.
    pub fn monitor(&mut self) -> Vec<MachineId> {
        let crashed: Vec<MachineId> = self
            .processes
            .iter_mut()
            .filter_map(|p| p.check().then(|| p.id()))
            .collect();
        for id in &crashed {
            warn!(machine = %id, "machine process exited");
        }
        crashed
    }

    pub fn status(&self) -> Vec<(MachineId, ProcessStatus, u16)> {
        self.processes
            .iter()
            .map(|p| (p.id(), p.status, p.port()))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.processes
            .iter()
            .filter(|p| p.status == ProcessStatus::Running)
            .count()
    }

    pub fn processes(&self) -> &[MachineProcess] {
        &self.processes
    }
}

impl Drop for ProcessCluster {
    fn drop(&mut self) {
        let _ = self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ClusterPlan {
        ClusterPlan::new(3, 5000).unwrap()
    }

    /// A spec whose children ignore the machine arguments and sleep.
    #[cfg(unix)]
    fn sleeper_spec() -> ProcessSpec {
        let mut spec = ProcessSpec::new("sh");
        spec.leading_args = vec!["-c".into(), "sleep 30".into(), "sh".into()];
        spec.startup_grace = Duration::from_millis(50);
        spec.spawn_gap = Duration::ZERO;
        spec
    }

    #[test]
    fn test_machine_args() {
        let plan = plan();
        let mut spec = ProcessSpec::new("tickmesh");
        spec.log_dir = Some(PathBuf::from("/tmp/logs"));
        spec.seed = Some(10);

        let args = spec.machine_args(&plan.machines[1], 1, 4);

        assert_eq!(
            args,
            vec![
                "machine",
                "--host",
                "127.0.0.1",
                "--port",
                "5001",
                "--peers",
                "5000,5002",
                "--clock-rate",
                "4",
                "--log-dir",
                "/tmp/logs",
                "--seed",
                "11",
            ]
        );
    }

    #[test]
    fn test_process_creation() {
        let process = MachineProcess::new(plan().machines[0].clone(), 3);

        assert_eq!(process.status, ProcessStatus::Stopped);
        assert_eq!(process.id(), MachineId::new(1).unwrap());
        assert_eq!(process.port(), 5000);
    }

    #[test]
    fn test_rate_count_mismatch() {
        assert!(matches!(
            ProcessCluster::new(&plan(), &[1, 2], ProcessSpec::new("tickmesh")),
            Err(Error::ClockRateCount {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let mut process = MachineProcess::new(plan().machines[0].clone(), 1);
        let spec = ProcessSpec::new("/nonexistent/tickmesh-binary");

        assert!(matches!(process.start(&spec, 0), Err(Error::SpawnError(_))));
        assert_eq!(process.status, ProcessStatus::Crashed);
    }

    #[cfg(unix)]
    #[test]
    fn test_cluster_start_monitor_stop() {
        let mut cluster = ProcessCluster::new(&plan(), &[1, 2, 3], sleeper_spec()).unwrap();

        cluster.start_all().unwrap();
        assert_eq!(cluster.running_count(), 3);
        assert!(cluster.monitor().is_empty());

        let second = MachineId::new(2).unwrap();
        if let Some(child) = cluster.processes[1].process.as_mut() {
            child.kill().unwrap();
            child.wait().unwrap();
        }
        assert_eq!(cluster.monitor(), vec![second]);
        assert!(cluster.monitor().is_empty());

        cluster.stop_all().unwrap();
        let statuses: Vec<ProcessStatus> = cluster.status().iter().map(|s| s.1).collect();
        assert_eq!(
            statuses,
            vec![
                ProcessStatus::Stopped,
                ProcessStatus::Crashed,
                ProcessStatus::Stopped
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_double_start_error() {
        let mut process = MachineProcess::new(plan().machines[0].clone(), 1);
        let spec = sleeper_spec();

        process.start(&spec, 0).unwrap();
        assert!(matches!(
            process.start(&spec, 0),
            Err(Error::MachineAlreadyRunning(_))
        ));
        process.stop(STOP_TIMEOUT).unwrap();
        assert_eq!(process.status, ProcessStatus::Stopped);
        assert!(!process.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_immediate_exit_is_a_start_failure() {
        let mut process = MachineProcess::new(plan().machines[0].clone(), 1);
        let mut spec = ProcessSpec::new("sh");
        spec.leading_args = vec!["-c".into(), "exit 3".into(), "sh".into()];
        spec.startup_grace = Duration::from_millis(300);

        assert!(matches!(
            process.start(&spec, 0),
            Err(Error::MachineStartFailed(..))
        ));
        assert_eq!(process.status, ProcessStatus::Crashed);
    }
}
