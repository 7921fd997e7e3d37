//! A single machine, normally a child of `tickmesh run --processes`.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tickmesh_cluster::{log_sink, machine_settings};
use tickmesh_config::TickmeshConfig;
use tickmesh_machine::{KillPortHolder, LifecycleState, Topology, VirtualMachine};
use tracing::{info, warn};

use crate::MachineArgs;
use crate::commands::run::rng;
use crate::signal;

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(mut config: TickmeshConfig, args: &MachineArgs) -> Result<()> {
    if let Some(host) = &args.host {
        config.network.host.clone_from(host);
    }
    if let Some(dir) = &args.log_dir {
        config.logging.directory.clone_from(dir);
    }

    let topology = Topology::resolve(args.port, args.peers.iter().copied());
    let id = topology.self_id();
    let seed = args.seed.or_else(|| {
        config
            .machine
            .seed
            .map(|s| s.wrapping_add(u64::from(id.get()) - 1))
    });
    let clock_rate = match args.clock_rate {
        Some(rate) => rate,
        None => rng(seed).gen_range(config.machine.min_clock_rate..=config.machine.max_clock_rate),
    };

    let settings = machine_settings(&config, args.port, args.peers.clone(), clock_rate, seed);
    let sink = log_sink(&config.logging.directory, id)
        .with_context(|| format!("Failed to open log in {}", config.logging.directory.display()))?;
    let mut machine = VirtualMachine::new(settings, sink)?;
    if config.connect.reclaim_port {
        machine = machine.with_reclaimer(KillPortHolder);
    }

    let interrupt = signal::interrupt_flag()?;
    let handle = machine.stop_handle();
    let watcher = thread::Builder::new()
        .name("tickmesh-signal".to_string())
        .spawn(move || {
            while handle.state() != LifecycleState::Stopped {
                if interrupt.load(Ordering::SeqCst) {
                    info!("interrupted");
                    handle.stop();
                    break;
                }
                thread::sleep(WATCH_INTERVAL);
            }
        })?;

    let result = machine.run();
    drop(machine);
    if watcher.join().is_err() {
        warn!("signal watcher panicked");
    }
    result.with_context(|| format!("Machine {id} failed"))
}
