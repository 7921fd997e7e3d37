//! Reading machine log files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tickmesh_types::{EventRecord, LogEntry, MachineId};
use tracing::debug;

use crate::{AnalysisError, AnalysisResult};

/// Parsed contents of one `machine_<id>.log`.
#[derive(Debug, Clone)]
pub struct MachineLog {
    pub machine: MachineId,
    pub path: PathBuf,
    /// Entries in file order.
    pub entries: Vec<LogEntry>,
    /// Lines that failed to parse, skipped.
    pub malformed: usize,
}

impl MachineLog {
    /// Builds a log from already parsed entries.
    pub fn from_entries(machine: MachineId, entries: Vec<LogEntry>) -> Self {
        Self {
            machine,
            path: PathBuf::from(machine.log_file_name()),
            entries,
            malformed: 0,
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &EventRecord> {
        self.entries.iter().map(|e| &e.event)
    }

    /// Cycle records (receive, send, internal) with their entries.
    pub fn cycles(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| e.event.is_cycle())
    }

    /// Clock rate from the startup record.
    pub fn clock_rate(&self) -> Option<u32> {
        self.events().find_map(|e| match e {
            EventRecord::Startup { clock_rate, .. } => Some(*clock_rate),
            _ => None,
        })
    }

    /// Peers named in the startup record.
    pub fn startup_peers(&self) -> Option<&[MachineId]> {
        self.events().find_map(|e| match e {
            EventRecord::Startup { peers, .. } => Some(peers.as_slice()),
            _ => None,
        })
    }
}

/// Reads one log file. Lines that are not valid [`LogEntry`] JSON are
/// counted and skipped.
pub fn read_log_file(path: impl AsRef<Path>, machine: MachineId) -> AnalysisResult<MachineLog> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;

    let mut entries = Vec::new();
    let mut malformed = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| AnalysisError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping malformed line");
                malformed += 1;
            }
        }
    }

    Ok(MachineLog {
        machine,
        path: path.to_path_buf(),
        entries,
        malformed,
    })
}

/// Reads every `machine_<id>.log` in `dir`, keyed by machine.
pub fn read_log_dir(dir: impl AsRef<Path>) -> AnalysisResult<BTreeMap<MachineId, MachineLog>> {
    let dir = dir.as_ref();
    let mut logs = BTreeMap::new();

    for entry in fs::read_dir(dir).map_err(|e| AnalysisError::io(dir, e))? {
        let entry = entry.map_err(|e| AnalysisError::io(dir, e))?;
        let name = entry.file_name();
        let Some(machine) = name.to_str().and_then(MachineId::from_log_file_name) else {
            continue;
        };
        logs.insert(machine, read_log_file(entry.path(), machine)?);
    }

    if logs.is_empty() {
        return Err(AnalysisError::NoLogs(dir.to_path_buf()));
    }
    Ok(logs)
}
