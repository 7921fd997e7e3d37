//! In-process cluster supervision: one thread per machine.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tickmesh_machine::{
    EventSink, KillPortHolder, LifecycleState, MachineResult, MachineSettings, StopHandle,
    Topology, VirtualMachine,
};
use tickmesh_types::{LogicalTime, MachineId};
use tracing::{info, warn};

use crate::{ClusterPlan, Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Builds the event sink for one machine.
pub type SinkFactory = dyn Fn(MachineId) -> io::Result<Arc<dyn EventSink>>;

/// Snapshot of one supervised machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus {
    pub id: MachineId,
    pub port: u16,
    pub clock_rate: u32,
    pub state: LifecycleState,
    pub clock: LogicalTime,
}

struct Slot {
    port: u16,
    clock_rate: u32,
    handle: StopHandle,
    pending: Option<VirtualMachine>,
    thread: Option<JoinHandle<MachineResult<()>>>,
}

/// Runs every machine of a cluster inside this process.
///
/// Every machine binds before any machine dials, so the first dial attempts
/// find their listeners already in place.
pub struct ClusterSupervisor {
    slots: BTreeMap<MachineId, Slot>,
    started: bool,
}

impl ClusterSupervisor {
    /// Creates one machine per settings entry. Nothing is bound yet.
    pub fn new(
        settings: Vec<MachineSettings>,
        reclaim_port: bool,
        sinks: &SinkFactory,
    ) -> Result<Self> {
        if settings.is_empty() {
            return Err(Error::InvalidMachineCount(0));
        }

        let mut slots = BTreeMap::new();
        for s in settings {
            let port = s.port;
            let clock_rate = s.clock_rate;
            let probe = Topology::resolve(port, s.peers.iter().copied());
            let id = probe.self_id();
            let sink = sinks(id)?;

            let mut machine =
                VirtualMachine::new(s, sink).map_err(|source| Error::Machine { id, source })?;
            if reclaim_port {
                machine = machine.with_reclaimer(KillPortHolder);
            }

            slots.insert(
                id,
                Slot {
                    port,
                    clock_rate,
                    handle: machine.stop_handle(),
                    pending: Some(machine),
                    thread: None,
                },
            );
        }

        Ok(Self {
            slots,
            started: false,
        })
    }

    /// Supervisor for `plan`, using already chosen settings.
    pub fn for_plan(
        plan: &ClusterPlan,
        settings: Vec<MachineSettings>,
        reclaim_port: bool,
        sinks: &SinkFactory,
    ) -> Result<Self> {
        if settings.len() != plan.len() {
            return Err(Error::ClockRateCount {
                expected: plan.len(),
                actual: settings.len(),
            });
        }
        Self::new(settings, reclaim_port, sinks)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Binds every machine, then spawns each machine's connect-and-run thread.
    ///
    /// A bind failure stops the machines already bound.
    pub fn start_all(&mut self) -> Result<()> {
        if self.started {
            if let Some(id) = self.slots.keys().next() {
                return Err(Error::MachineAlreadyRunning(*id));
            }
        }
        self.started = true;

        let mut failure = None;
        for (id, slot) in &mut self.slots {
            let Some(machine) = slot.pending.as_mut() else {
                continue;
            };
            match machine.start() {
                Ok(addr) => info!(machine = %id, %addr, "machine bound"),
                Err(source) => {
                    failure = Some(Error::Machine { id: *id, source });
                    break;
                }
            }
        }
        if let Some(err) = failure {
            warn!(error = %err, "cluster startup failed");
            if let Err(e) = self.stop_all() {
                warn!(error = %e, "cleanup after failed startup");
            }
            return Err(err);
        }

        for (id, slot) in &mut self.slots {
            let Some(mut machine) = slot.pending.take() else {
                continue;
            };
            let thread = thread::Builder::new()
                .name(format!("tickmesh-machine-{id}"))
                .spawn(move || {
                    machine.connect()?;
                    machine.run_until_stopped()
                })?;
            slot.thread = Some(thread);
        }

        info!(machines = self.slots.len(), "cluster started");
        Ok(())
    }

    /// Blocks until every machine is running.
    pub fn wait_until_running(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let lagging: Vec<MachineId> = self
                .slots
                .iter()
                .filter(|(_, slot)| slot.handle.state() != LifecycleState::Running)
                .map(|(id, _)| *id)
                .collect();
            if lagging.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::StartupTimeout(timeout, lagging));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn status(&self) -> Vec<MachineStatus> {
        self.slots
            .iter()
            .map(|(id, slot)| MachineStatus {
                id: *id,
                port: slot.port,
                clock_rate: slot.clock_rate,
                state: slot.handle.state(),
                clock: slot.handle.clock(),
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.handle.state() == LifecycleState::Running)
            .count()
    }

    /// Stops a single machine and waits for its thread.
    pub fn stop_machine(&mut self, id: MachineId) -> Result<()> {
        let slot = self.slots.get_mut(&id).ok_or(Error::MachineNotFound(id))?;
        slot.handle.stop();
        Self::finish(id, slot)
    }

    /// Signals every machine, then joins every thread.
    ///
    /// Returns the first machine error after all threads are joined.
    pub fn stop_all(&mut self) -> Result<()> {
        for slot in self.slots.values() {
            slot.handle.stop();
        }

        let mut first_error = None;
        for (id, slot) in &mut self.slots {
            if let Err(e) = Self::finish(*id, slot) {
                warn!(machine = %id, error = %e, "machine ended with error");
                first_error.get_or_insert(e);
            }
        }

        info!("cluster stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn finish(id: MachineId, slot: &mut Slot) -> Result<()> {
        if let Some(mut machine) = slot.pending.take() {
            machine
                .stop()
                .map_err(|source| Error::Machine { id, source })?;
        }
        match slot.thread.take().map(JoinHandle::join) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(source))) => Err(Error::Machine { id, source }),
            Some(Err(_)) => Err(Error::Panicked(id)),
        }
    }

    /// Starts the cluster, lets it run for `duration` or until `interrupt`
    /// is set, then stops it. `Duration::MAX` runs until interrupted.
    pub fn run_for(&mut self, duration: Duration, interrupt: &AtomicBool) -> Result<()> {
        self.start_all()?;

        let deadline = Instant::now().checked_add(duration);
        while !interrupt.load(Ordering::SeqCst) {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                break;
            }
            thread::sleep(remaining.map_or(POLL_INTERVAL, |r| r.min(POLL_INTERVAL)));
        }
        if interrupt.load(Ordering::SeqCst) {
            info!("interrupted");
        }

        self.stop_all()
    }
}

impl Drop for ClusterSupervisor {
    fn drop(&mut self) {
        let _ = self.stop_all();
    }
}

impl std::fmt::Debug for ClusterSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSupervisor")
            .field("machines", &self.slots.keys().collect::<Vec<_>>())
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tickmesh_machine::MemorySink;
    use tickmesh_types::EventKind;

    fn free_ports(n: usize) -> Vec<u16> {
        let listeners: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let mut ports: Vec<u16> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();
        ports.sort_unstable();
        ports
    }

    fn fast_settings(ports: &[u16], rates: &[u32]) -> Vec<MachineSettings> {
        ports
            .iter()
            .zip(rates)
            .enumerate()
            .map(|(i, (&port, &rate))| {
                let mut s = MachineSettings::new(
                    port,
                    ports.iter().copied().filter(|&p| p != port),
                    rate,
                );
                s.startup_base_delay = Duration::ZERO;
                s.startup_per_machine_factor = Duration::ZERO;
                s.retry_delay = Duration::from_millis(20);
                s.idle_sleep = Duration::from_millis(5);
                s.seed = Some(i as u64);
                s
            })
            .collect()
    }

    fn memory_factory(sink: &Arc<MemorySink>) -> impl Fn(MachineId) -> io::Result<Arc<dyn EventSink>> + use<> {
        let sink = Arc::clone(sink);
        move |_| Ok(Arc::clone(&sink) as Arc<dyn EventSink>)
    }

    #[test]
    fn test_cluster_runs_and_stops() {
        let ports = free_ports(3);
        let sink = Arc::new(MemorySink::new());
        let factory = memory_factory(&sink);
        let mut supervisor =
            ClusterSupervisor::new(fast_settings(&ports, &[10, 20, 30]), false, &factory)
                .unwrap();

        supervisor.start_all().unwrap();
        supervisor.wait_until_running(Duration::from_secs(5)).unwrap();
        assert_eq!(supervisor.running_count(), 3);

        thread::sleep(Duration::from_millis(500));
        let status = supervisor.status();
        assert_eq!(status.len(), 3);
        assert_eq!(status[0].port, ports[0]);
        assert_eq!(status[2].clock_rate, 30);
        assert!(status.iter().all(|s| s.clock > LogicalTime::ZERO));

        supervisor.stop_all().unwrap();
        assert!(
            supervisor
                .status()
                .iter()
                .all(|s| s.state == LifecycleState::Stopped)
        );

        let stopped = sink
            .records()
            .iter()
            .filter(|(_, r)| r.kind() == EventKind::Stopped)
            .count();
        assert_eq!(stopped, 3);
    }

    #[test]
    fn test_bind_failure_stops_the_rest() {
        let ports = free_ports(2);
        let _blocker = TcpListener::bind(("127.0.0.1", ports[1])).unwrap();

        let mut settings = fast_settings(&ports, &[5, 5]);
        for s in &mut settings {
            s.max_retries = 1;
        }
        let sink = Arc::new(MemorySink::new());
        let factory = memory_factory(&sink);
        let mut supervisor = ClusterSupervisor::new(settings, false, &factory).unwrap();

        let err = supervisor.start_all().unwrap_err();
        assert!(matches!(err, Error::Machine { id, .. } if id == MachineId::from_rank(1)));
        assert!(
            supervisor
                .status()
                .iter()
                .all(|s| s.state == LifecycleState::Stopped)
        );
    }

    #[test]
    fn test_run_for_honors_interrupt() {
        let ports = free_ports(2);
        let sink = Arc::new(MemorySink::new());
        let factory = memory_factory(&sink);
        let mut supervisor =
            ClusterSupervisor::new(fast_settings(&ports, &[5, 5]), false, &factory).unwrap();

        let interrupt = AtomicBool::new(true);
        let started = Instant::now();
        supervisor
            .run_for(Duration::from_secs(30), &interrupt)
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_stop_unknown_machine() {
        let ports = free_ports(1);
        let sink = Arc::new(MemorySink::new());
        let factory = memory_factory(&sink);
        let mut supervisor =
            ClusterSupervisor::new(fast_settings(&ports, &[1]), false, &factory).unwrap();

        let unknown = MachineId::new(9).unwrap();
        assert!(matches!(
            supervisor.stop_machine(unknown),
            Err(Error::MachineNotFound(id)) if id == unknown
        ));
    }
}
