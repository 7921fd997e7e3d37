//! Log statistics.

use std::path::Path;

use anyhow::{Context, Result};
use tickmesh_analysis::{ExperimentReport, read_log_dir};

use crate::style::{self, SemanticStyle};

pub fn run(log_dir: &Path, json: bool) -> Result<()> {
    let logs = read_log_dir(log_dir)
        .with_context(|| format!("Failed to read logs from {}", log_dir.display()))?;
    let report = ExperimentReport::from_logs(1, &logs);

    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    println!("{}", format!("Analysis of {}", log_dir.display()).header());
    let rows: Vec<Vec<String>> = report
        .machines
        .iter()
        .map(|m| {
            vec![
                m.machine.to_string(),
                m.clock_rate.map_or_else(|| "?".to_string(), |r| r.to_string()),
                m.sent.to_string(),
                m.received.to_string(),
                m.internal.to_string(),
                m.max_clock.to_string(),
                format!("{:.2}", m.drift.avg),
                m.drift.max.to_string(),
                format!("{:.2}", m.avg_queue),
                m.max_queue.to_string(),
            ]
        })
        .collect();
    println!(
        "{}",
        style::table(
            &[
                "Machine",
                "Rate",
                "Sent",
                "Received",
                "Internal",
                "Max clock",
                "Avg drift",
                "Max drift",
                "Avg queue",
                "Max queue",
            ],
            &rows,
        )
    );
    println!();
    print!("{report}");
    Ok(())
}
