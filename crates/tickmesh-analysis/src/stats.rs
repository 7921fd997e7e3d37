//! Per-machine and cluster-wide statistics.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tickmesh_types::{EventRecord, LogicalTime, MachineId};

use crate::{AnalysisError, AnalysisResult, MachineLog};

/// Summary of a set of drift values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftStats {
    pub count: usize,
    pub avg: f64,
    pub min: u64,
    pub max: u64,
}

impl DriftStats {
    pub fn from_values(values: &[u64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let sum: u64 = values.iter().sum();
        Self {
            count: values.len(),
            avg: sum as f64 / values.len() as f64,
            min: values.iter().copied().min().unwrap_or(0),
            max: values.iter().copied().max().unwrap_or(0),
        }
    }
}

/// Drift observed on messages from one sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderDrift {
    pub sender: MachineId,
    pub drift: DriftStats,
}

/// Statistics for one machine's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStats {
    pub machine: MachineId,
    pub clock_rate: Option<u32>,
    pub sent: usize,
    pub received: usize,
    pub internal: usize,
    pub max_clock: LogicalTime,
    /// Drift of every received message, in log order.
    pub drifts: Vec<u64>,
    pub drift: DriftStats,
    pub drift_by_sender: Vec<SenderDrift>,
    pub avg_queue: f64,
    pub max_queue: usize,
    /// Wall-clock span between the first and last cycle, in seconds.
    pub duration_secs: f64,
}

impl MachineStats {
    pub fn from_log(log: &MachineLog) -> Self {
        let mut sent = 0;
        let mut received = 0;
        let mut internal = 0;
        let mut max_clock = LogicalTime::ZERO;
        let mut drifts = Vec::new();
        let mut queues = Vec::new();
        let mut by_sender: BTreeMap<MachineId, Vec<u64>> = BTreeMap::new();

        for event in log.events() {
            match event {
                EventRecord::Receive {
                    sender,
                    drift,
                    queue_length,
                    ..
                } => {
                    received += 1;
                    drifts.push(*drift);
                    queues.push(*queue_length);
                    by_sender.entry(*sender).or_default().push(*drift);
                }
                EventRecord::Send { .. } => sent += 1,
                EventRecord::Internal { .. } => internal += 1,
                _ => {}
            }
            if let Some(clock) = event.cycle_clock() {
                max_clock = max_clock.max(clock);
            }
        }

        let (avg_queue, max_queue) = if queues.is_empty() {
            (0.0, 0)
        } else {
            let sum: usize = queues.iter().sum();
            (
                sum as f64 / queues.len() as f64,
                queues.iter().copied().max().unwrap_or(0),
            )
        };

        let mut cycles = log.cycles();
        let first = cycles.next().map(|e| e.timestamp);
        let last = cycles.last().map(|e| e.timestamp).or(first);
        let duration_secs = match (first, last) {
            (Some(a), Some(b)) => (b - a).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };

        Self {
            machine: log.machine,
            clock_rate: log.clock_rate(),
            sent,
            received,
            internal,
            max_clock,
            drift: DriftStats::from_values(&drifts),
            drifts,
            drift_by_sender: by_sender
                .into_iter()
                .map(|(sender, values)| SenderDrift {
                    sender,
                    drift: DriftStats::from_values(&values),
                })
                .collect(),
            avg_queue,
            max_queue,
            duration_secs,
        }
    }

    pub fn total_events(&self) -> usize {
        self.sent + self.received + self.internal
    }
}

/// Statistics across every machine of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub max_drift: u64,
    pub avg_drift: f64,
    pub max_queue: usize,
    /// Mean of the per-machine queue averages.
    pub avg_queue: f64,
}

impl GlobalStats {
    pub fn from_machines(machines: &[MachineStats]) -> Self {
        if machines.is_empty() {
            return Self::default();
        }
        let all_drifts: Vec<u64> = machines.iter().flat_map(|m| m.drifts.iter().copied()).collect();
        let drift = DriftStats::from_values(&all_drifts);
        Self {
            max_drift: drift.max,
            avg_drift: drift.avg,
            max_queue: machines.iter().map(|m| m.max_queue).max().unwrap_or(0),
            avg_queue: machines.iter().map(|m| m.avg_queue).sum::<f64>() / machines.len() as f64,
        }
    }
}

/// Analysis of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub experiment_id: u32,
    pub machines: Vec<MachineStats>,
    pub global: GlobalStats,
    /// Log lines that could not be parsed.
    pub malformed_lines: usize,
}

impl ExperimentReport {
    pub fn from_logs(experiment_id: u32, logs: &BTreeMap<MachineId, MachineLog>) -> Self {
        let machines: Vec<MachineStats> = logs.values().map(MachineStats::from_log).collect();
        Self {
            experiment_id,
            global: GlobalStats::from_machines(&machines),
            machines,
            malformed_lines: logs.values().map(|l| l.malformed).sum(),
        }
    }

    pub fn file_name(experiment_id: u32) -> String {
        format!("experiment_{experiment_id}_results.json")
    }

    pub fn to_json(&self) -> AnalysisResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes `experiment_<id>_results.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> AnalysisResult<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| AnalysisError::io(dir, e))?;
        let path = dir.join(Self::file_name(self.experiment_id));
        fs::write(&path, self.to_json()?).map_err(|e| AnalysisError::io(&path, e))?;
        Ok(path)
    }
}

impl Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Experiment {}", self.experiment_id)?;
        for m in &self.machines {
            let rate = m
                .clock_rate
                .map_or_else(|| "?".to_string(), |r| r.to_string());
            writeln!(f, "  Machine {} (clock rate {rate})", m.machine)?;
            writeln!(
                f,
                "    events: {} sent, {} received, {} internal over {:.1}s",
                m.sent, m.received, m.internal, m.duration_secs
            )?;
            writeln!(f, "    max logical clock: {}", m.max_clock)?;
            writeln!(
                f,
                "    drift: avg {:.2}, min {}, max {}",
                m.drift.avg, m.drift.min, m.drift.max
            )?;
            for s in &m.drift_by_sender {
                writeln!(
                    f,
                    "      from machine {}: {} messages, avg {:.2}, max {}",
                    s.sender, s.drift.count, s.drift.avg, s.drift.max
                )?;
            }
            writeln!(f, "    queue: avg {:.2}, max {}", m.avg_queue, m.max_queue)?;
        }
        writeln!(
            f,
            "  Global: max drift {}, avg drift {:.2}, max queue {}, avg queue {:.2}",
            self.global.max_drift, self.global.avg_drift, self.global.max_queue, self.global.avg_queue
        )?;
        if self.malformed_lines > 0 {
            writeln!(f, "  Skipped {} malformed log lines", self.malformed_lines)?;
        }
        Ok(())
    }
}
