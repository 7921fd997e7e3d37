//! Repeated timed runs with a saved report per run.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use tickmesh_analysis::{ExperimentReport, read_log_dir};
use tickmesh_cluster::ClusterPlan;
use tickmesh_config::TickmeshConfig;
use tracing::info;

use crate::ExperimentArgs;
use crate::commands::run::{apply_fast, rng, run_in_process};
use crate::signal;
use crate::style::{self, SemanticStyle};

pub fn run(mut config: TickmeshConfig, args: &ExperimentArgs) -> Result<()> {
    if let Some(machines) = args.machines {
        config.network.machines = machines;
    }
    if let Some(base_port) = args.base_port {
        config.network.base_port = base_port;
    }
    if args.fast {
        apply_fast(&mut config);
    }
    config.validate().context("Invalid experiment options")?;

    let interrupt = signal::interrupt_flag()?;
    let plan = ClusterPlan::from_config(&config)?;
    let duration = Duration::from_secs(args.duration);
    let base_seed = config.machine.seed;
    let mut summary = Vec::new();

    for k in 1..=args.count {
        if interrupt.load(Ordering::SeqCst) {
            break;
        }
        println!(
            "{}",
            format!("Experiment {k}/{} ({}s)", args.count, args.duration).header()
        );

        let mut run_config = config.clone();
        run_config.logging.directory = args.output.join(format!("experiment_{k}")).join("logs");
        run_config.machine.seed = base_seed.map(|s| s.wrapping_add(u64::from(k) * 1000));

        let rates = plan.clock_rates(&run_config, &mut rng(run_config.machine.seed))?;
        run_in_process(&run_config, &plan, &rates, duration, &interrupt)
            .with_context(|| format!("Experiment {k} failed"))?;

        let logs = read_log_dir(&run_config.logging.directory)?;
        let report = ExperimentReport::from_logs(k, &logs);
        let path = report.save(&args.output)?;
        info!(experiment = k, path = %path.display(), "saved results");
        style::print_success(&format!("Saved {}", path.display()));

        summary.push(vec![
            k.to_string(),
            rates
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
            report.global.max_drift.to_string(),
            format!("{:.2}", report.global.avg_drift),
            report.global.max_queue.to_string(),
            format!("{:.2}", report.global.avg_queue),
        ]);
    }

    if !summary.is_empty() {
        println!(
            "{}",
            style::table(
                &[
                    "Experiment",
                    "Clock rates",
                    "Max drift",
                    "Avg drift",
                    "Max queue",
                    "Avg queue"
                ],
                &summary,
            )
        );
    }
    Ok(())
}
