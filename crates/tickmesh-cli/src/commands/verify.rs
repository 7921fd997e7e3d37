//! Log verification.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tickmesh_analysis::{read_log_dir, verify_logs};

use crate::style::{self, SemanticStyle};

/// Prints every check and fails if any check failed.
pub fn run(log_dir: &Path) -> Result<()> {
    let logs = read_log_dir(log_dir)
        .with_context(|| format!("Failed to read logs from {}", log_dir.display()))?;
    let report = verify_logs(&logs);

    for outcome in &report.outcomes {
        let mark = if outcome.passed {
            "PASS".success()
        } else {
            "FAIL".error()
        };
        let machine = outcome
            .machine
            .map_or_else(String::new, |m| format!(" (machine {m})"));
        println!("[{mark}] {}{machine}: {}", outcome.name, outcome.details);
    }

    let failed = report.failures().count();
    if failed > 0 {
        style::print_error(&format!("{failed} of {} checks failed", report.outcomes.len()));
        bail!("verification failed");
    }
    style::print_success(&format!("All {} checks passed", report.outcomes.len()));
    Ok(())
}
