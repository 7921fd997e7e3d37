//! Destinations for event records.
//!
//! A machine is handed one [`EventSink`] and reports every record to it.
//! Sinks must not fail the caller: write errors are logged and dropped.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tickmesh_types::{EventRecord, LogEntry, MachineId};
use tracing::{info, warn};

/// Receives a machine's event records.
pub trait EventSink: Send + Sync {
    fn emit(&self, machine: MachineId, record: &EventRecord);
}

/// Forwards records to `tracing` under the `tickmesh::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, machine: MachineId, record: &EventRecord) {
        match record {
            EventRecord::Receive {
                sender,
                old_clock,
                sender_clock,
                new_clock,
                drift,
                queue_length,
            } => info!(
                target: "tickmesh::events",
                machine = %machine,
                sender = %sender,
                old_clock = %old_clock,
                sender_clock = %sender_clock,
                new_clock = %new_clock,
                drift,
                queue_length,
                "receive"
            ),
            EventRecord::Send { targets, new_clock } => info!(
                target: "tickmesh::events",
                machine = %machine,
                ?targets,
                new_clock = %new_clock,
                "send"
            ),
            EventRecord::Internal { new_clock } => info!(
                target: "tickmesh::events",
                machine = %machine,
                new_clock = %new_clock,
                "internal"
            ),
            other => info!(target: "tickmesh::events", machine = %machine, record = ?other, "lifecycle"),
        }
    }
}

/// Appends one JSON [`LogEntry`] per line to `<dir>/machine_<id>.log`.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Creates (truncating) the log file for `machine` inside `dir`.
    pub fn create(dir: impl AsRef<Path>, machine: MachineId) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(machine.log_file_name());
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, machine: MachineId, record: &EventRecord) {
        let entry = LogEntry::now(machine, record.clone());
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to encode log entry");
                return;
            }
        };
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(&line) {
            warn!(path = %self.path.display(), error = %e, "failed to write log entry");
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(MachineId, EventRecord)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far, in emission order.
    pub fn records(&self) -> Vec<(MachineId, EventRecord)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records emitted by `machine`, in emission order.
    pub fn records_for(&self, machine: MachineId) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(m, _)| *m == machine)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, machine: MachineId, record: &EventRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((machine, record.clone()));
    }
}

/// Sends every record to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, machine: MachineId, record: &EventRecord) {
        for sink in &self.sinks {
            sink.emit(machine, record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tickmesh_types::LogicalTime;

    fn id(n: u32) -> MachineId {
        MachineId::new(n).unwrap()
    }

    #[test]
    fn json_lines_sink_writes_one_entry_per_line() {
        let dir = tempdir().unwrap();
        let sink = JsonLinesSink::create(dir.path().join("logs"), id(2)).unwrap();

        sink.emit(
            id(2),
            &EventRecord::Internal {
                new_clock: LogicalTime::new(1),
            },
        );
        sink.emit(
            id(2),
            &EventRecord::Send {
                targets: vec![id(1)],
                new_clock: LogicalTime::new(2),
            },
        );

        assert!(sink.path().ends_with("machine_2.log"));
        let contents = fs::read_to_string(sink.path()).unwrap();
        let entries: Vec<LogEntry> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.machine == id(2)));
        assert_eq!(entries[1].event.cycle_clock(), Some(LogicalTime::new(2)));
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new()
            .with(Arc::clone(&a) as Arc<dyn EventSink>)
            .with(Arc::clone(&b) as Arc<dyn EventSink>)
            .with(Arc::new(TracingSink));
        assert_eq!(fanout.len(), 3);

        let record = EventRecord::Stopped {
            final_clock: LogicalTime::new(4),
        };
        fanout.emit(id(1), &record);

        assert_eq!(a.records(), vec![(id(1), record.clone())]);
        assert_eq!(b.records_for(id(1)), vec![record]);
        assert!(b.records_for(id(2)).is_empty());
    }
}
