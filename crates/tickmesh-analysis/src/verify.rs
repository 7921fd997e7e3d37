//! Checks a run's logs against the machine invariants.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tickmesh_types::{Direction, EventRecord, LogicalTime, MachineId};

use crate::MachineLog;

/// Replayed window length. Log timestamps trail the limiter's own clock
/// reads slightly, so the replay is a little shorter than one second.
const REPLAY_WINDOW_MS: i64 = 950;

/// Result of one check on one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub machine: Option<MachineId>,
    pub passed: bool,
    pub details: String,
}

impl CheckOutcome {
    fn pass(name: &str, machine: MachineId, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            machine: Some(machine),
            passed: true,
            details: details.into(),
        }
    }

    fn fail(name: &str, machine: MachineId, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            machine: Some(machine),
            passed: false,
            details: details.into(),
        }
    }
}

impl Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.passed { "PASS" } else { "FAIL" };
        match self.machine {
            Some(m) => write!(f, "[{mark}] {} (machine {m}): {}", self.name, self.details),
            None => write!(f, "[{mark}] {}: {}", self.name, self.details),
        }
    }
}

/// Every check outcome for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }
}

impl Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            writeln!(f, "{outcome}")?;
        }
        let failed = self.failures().count();
        if failed == 0 {
            writeln!(f, "All {} checks passed", self.outcomes.len())
        } else {
            writeln!(f, "{failed} of {} checks failed", self.outcomes.len())
        }
    }
}

/// Runs every check against every machine.
pub fn verify_logs(logs: &BTreeMap<MachineId, MachineLog>) -> VerificationReport {
    let mut outcomes = Vec::new();
    for log in logs.values() {
        outcomes.push(check_clock_rate(log));
        outcomes.push(check_logical_clock(log));
        outcomes.push(check_connections(log));
        outcomes.push(check_participation(log));
    }
    VerificationReport { outcomes }
}

/// Replays the one-second limiter windows and fails if any window holds
/// more cycles than the machine's clock rate.
pub fn check_clock_rate(log: &MachineLog) -> CheckOutcome {
    const NAME: &str = "clock rate";
    let Some(rate) = log.clock_rate() else {
        return CheckOutcome::fail(NAME, log.machine, "no startup record");
    };

    let timestamps: Vec<DateTime<Utc>> = log.cycles().map(|e| e.timestamp).collect();
    let busiest = busiest_window(&timestamps);

    if busiest <= rate as usize {
        CheckOutcome::pass(
            NAME,
            log.machine,
            format!("at most {busiest} cycles per second (rate {rate})"),
        )
    } else {
        CheckOutcome::fail(
            NAME,
            log.machine,
            format!("{busiest} cycles in one second exceeds rate {rate}"),
        )
    }
}

fn busiest_window(timestamps: &[DateTime<Utc>]) -> usize {
    let window = TimeDelta::milliseconds(REPLAY_WINDOW_MS);
    let mut busiest = 0;
    let mut start = None;
    let mut count = 0;
    for &ts in timestamps {
        match start {
            Some(s) if ts - s < window => count += 1,
            _ => {
                start = Some(ts);
                count = 1;
            }
        }
        busiest = busiest.max(count);
    }
    busiest
}

/// Cycle clocks must strictly increase, and every receive must follow
/// `max(local, sender) + 1`.
pub fn check_logical_clock(log: &MachineLog) -> CheckOutcome {
    const NAME: &str = "logical clock";
    let mut previous: Option<LogicalTime> = None;

    for (index, event) in log.events().enumerate() {
        if let EventRecord::Receive {
            old_clock,
            sender_clock,
            new_clock,
            ..
        } = event
        {
            let expected = (*old_clock).max(*sender_clock).next();
            if *new_clock != expected {
                return CheckOutcome::fail(
                    NAME,
                    log.machine,
                    format!(
                        "entry {index}: receive moved clock to {new_clock}, expected {expected}"
                    ),
                );
            }
        }
        let Some(clock) = event.cycle_clock() else {
            continue;
        };
        if let Some(prev) = previous {
            if clock <= prev {
                return CheckOutcome::fail(
                    NAME,
                    log.machine,
                    format!("entry {index}: clock went from {prev} to {clock}"),
                );
            }
        }
        previous = Some(clock);
    }

    let last = previous.unwrap_or(LogicalTime::ZERO);
    CheckOutcome::pass(NAME, log.machine, format!("increasing up to {last}"))
}

/// Machine `i` dials exactly the higher ids and accepts exactly the lower ones.
pub fn check_connections(log: &MachineLog) -> CheckOutcome {
    const NAME: &str = "connections";
    let Some(peers) = log.startup_peers() else {
        return CheckOutcome::fail(NAME, log.machine, "no startup record");
    };

    let me = log.machine;
    let expected_dialed: BTreeSet<MachineId> = peers.iter().copied().filter(|p| *p > me).collect();
    let expected_accepted: BTreeSet<MachineId> =
        peers.iter().copied().filter(|p| *p < me).collect();

    let mut dialed = BTreeSet::new();
    let mut accepted = BTreeSet::new();
    for event in log.events() {
        if let EventRecord::Connected {
            peer, direction, ..
        } = event
        {
            match direction {
                Direction::Dialed => dialed.insert(*peer),
                Direction::Accepted => accepted.insert(*peer),
            };
        }
    }

    if dialed == expected_dialed && accepted == expected_accepted {
        CheckOutcome::pass(
            NAME,
            me,
            format!(
                "dialed {}, accepted {}",
                id_list(&dialed),
                id_list(&accepted)
            ),
        )
    } else {
        CheckOutcome::fail(
            NAME,
            me,
            format!(
                "dialed {} (expected {}), accepted {} (expected {})",
                id_list(&dialed),
                id_list(&expected_dialed),
                id_list(&accepted),
                id_list(&expected_accepted)
            ),
        )
    }
}

fn id_list(ids: &BTreeSet<MachineId>) -> String {
    let list: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("[{}]", list.join(", "))
}

/// The machine both sent and received at least one message.
pub fn check_participation(log: &MachineLog) -> CheckOutcome {
    const NAME: &str = "participation";
    let sent = log
        .events()
        .filter(|e| matches!(e, EventRecord::Send { targets, .. } if !targets.is_empty()))
        .count();
    let received = log
        .events()
        .filter(|e| matches!(e, EventRecord::Receive { .. }))
        .count();

    let details = format!("{sent} sent, {received} received");
    if sent > 0 && received > 0 {
        CheckOutcome::pass(NAME, log.machine, details)
    } else {
        CheckOutcome::fail(NAME, log.machine, details)
    }
}
