//! Cluster runs, in-process or as child processes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tickmesh_cluster::{
    ClusterPlan, ClusterSupervisor, MachineStatus, ProcessCluster, ProcessSpec, log_sink,
};
use tickmesh_config::{ConnectConfig, TickmeshConfig};
use tracing::{info, warn};

use crate::RunArgs;
use crate::signal;
use crate::style::{self, SemanticStyle};

const MONITOR_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(mut config: TickmeshConfig, args: &RunArgs, project: &Path) -> Result<()> {
    apply_overrides(&mut config, args);
    config.validate().context("Invalid run options")?;

    let interrupt = signal::interrupt_flag()?;
    let plan = ClusterPlan::from_config(&config)?;
    let rates = plan.clock_rates(&config, &mut rng(config.machine.seed))?;
    let duration = args.duration.map_or(Duration::MAX, Duration::from_secs);

    print_plan(&plan, &rates, &config);
    if args.duration.is_none() {
        style::print_hint("Press Ctrl+C to stop");
    }

    if args.processes {
        run_processes(&config, &plan, &rates, project, duration, &interrupt)?;
    } else {
        let statuses = run_in_process(&config, &plan, &rates, duration, &interrupt)?;
        print_final(&statuses);
    }

    let dir = config.logging.directory.display();
    style::print_success(&format!("Logs written to {dir}"));
    style::print_hint(&format!("tickmesh analyze {dir}"));
    Ok(())
}

fn apply_overrides(config: &mut TickmeshConfig, args: &RunArgs) {
    if let Some(machines) = args.machines {
        config.network.machines = machines;
    }
    if let Some(base_port) = args.base_port {
        config.network.base_port = base_port;
    }
    if !args.clock_rates.is_empty() {
        config.machine.clock_rates.clone_from(&args.clock_rates);
    }
    if args.seed.is_some() {
        config.machine.seed = args.seed;
    }
    if let Some(dir) = &args.log_dir {
        config.logging.directory.clone_from(dir);
    }
    if args.fast {
        apply_fast(config);
    }
}

/// Replaces startup delays and retry timings with local-host values.
pub(crate) fn apply_fast(config: &mut TickmeshConfig) {
    let fast = TickmeshConfig::local_fast();
    config.connect = ConnectConfig {
        max_retries: config.connect.max_retries,
        reuse_port: config.connect.reuse_port,
        reclaim_port: config.connect.reclaim_port,
        ..fast.connect
    };
    config.machine.idle_sleep_ms = fast.machine.idle_sleep_ms;
}

pub(crate) fn rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

/// Runs the cluster as threads and returns the final machine states.
pub(crate) fn run_in_process(
    config: &TickmeshConfig,
    plan: &ClusterPlan,
    rates: &[u32],
    duration: Duration,
    interrupt: &AtomicBool,
) -> Result<Vec<MachineStatus>> {
    let settings = plan.settings_with_rates(config, rates)?;
    let dir = config.logging.directory.clone();
    let mut supervisor = ClusterSupervisor::for_plan(
        plan,
        settings,
        config.connect.reclaim_port,
        &move |id| log_sink(&dir, id),
    )?;
    supervisor.run_for(duration, interrupt)?;
    Ok(supervisor.status())
}

fn run_processes(
    config: &TickmeshConfig,
    plan: &ClusterPlan,
    rates: &[u32],
    project: &Path,
    duration: Duration,
    interrupt: &AtomicBool,
) -> Result<()> {
    let mut spec = ProcessSpec::current_exe()?;
    spec.leading_args = vec!["--project".to_string(), project.display().to_string()];
    spec.host.clone_from(&config.network.host);
    spec.log_dir = Some(config.logging.directory.clone());
    spec.seed = config.machine.seed;
    spec.env = child_env(config);

    let mut cluster = ProcessCluster::new(plan, rates, spec)?;
    cluster.start_all()?;

    let deadline = Instant::now().checked_add(duration);
    while !interrupt.load(Ordering::SeqCst) && deadline.is_none_or(|d| Instant::now() < d) {
        thread::sleep(MONITOR_INTERVAL);
        for id in cluster.monitor() {
            warn!(machine = %id, "machine process exited early");
        }
        if cluster.running_count() == 0 {
            warn!("every machine process has exited");
            break;
        }
    }

    info!("stopping machine processes");
    cluster.stop_all()?;
    Ok(())
}

/// Timing and event settings forwarded to machine processes, which load
/// the rest of their configuration from the same project directory.
fn child_env(config: &TickmeshConfig) -> Vec<(String, String)> {
    let c = &config.connect;
    let e = &config.events;
    [
        ("CONNECT__MAX_RETRIES", c.max_retries.to_string()),
        ("CONNECT__RETRY_DELAY_MS", c.retry_delay_ms.to_string()),
        ("CONNECT__CONNECT_TIMEOUT_MS", c.connect_timeout_ms.to_string()),
        ("CONNECT__HANDSHAKE_TIMEOUT_MS", c.handshake_timeout_ms.to_string()),
        ("CONNECT__STARTUP_BASE_DELAY_MS", c.startup_base_delay_ms.to_string()),
        (
            "CONNECT__STARTUP_PER_MACHINE_FACTOR_MS",
            c.startup_per_machine_factor_ms.to_string(),
        ),
        ("CONNECT__REUSE_PORT", c.reuse_port.to_string()),
        ("CONNECT__RECLAIM_PORT", c.reclaim_port.to_string()),
        ("MACHINE__IDLE_SLEEP_MS", config.machine.idle_sleep_ms.to_string()),
        ("EVENTS__DRAW_MIN", e.draw_min.to_string()),
        ("EVENTS__DRAW_MAX", e.draw_max.to_string()),
        ("EVENTS__SEND_TO_FIRST", e.send_to_first.to_string()),
        ("EVENTS__SEND_TO_SECOND", e.send_to_second.to_string()),
        ("EVENTS__SEND_TO_ALL", e.send_to_all.to_string()),
        ("LOGGING__LEVEL", config.logging.level.clone()),
    ]
    .into_iter()
    .map(|(key, value)| (format!("TICKMESH_{key}"), value))
    .collect()
}

fn print_plan(plan: &ClusterPlan, rates: &[u32], config: &TickmeshConfig) {
    println!(
        "{}",
        format!(
            "Starting {} machines on {}:{}-{}",
            plan.len(),
            config.network.host,
            plan.base_port,
            plan.ports().last().copied().unwrap_or(plan.base_port)
        )
        .header()
    );
    let rows: Vec<Vec<String>> = plan
        .machines
        .iter()
        .zip(rates)
        .map(|(m, rate)| vec![m.id.to_string(), m.port.to_string(), rate.to_string()])
        .collect();
    println!("{}", style::table(&["Machine", "Port", "Clock rate"], &rows));
}

fn print_final(statuses: &[MachineStatus]) {
    let rows: Vec<Vec<String>> = statuses
        .iter()
        .map(|s| {
            vec![
                s.id.to_string(),
                s.port.to_string(),
                s.clock_rate.to_string(),
                s.state.to_string(),
                s.clock.to_string(),
            ]
        })
        .collect();
    println!(
        "{}",
        style::table(&["Machine", "Port", "Clock rate", "State", "Final clock"], &rows)
    );
}
