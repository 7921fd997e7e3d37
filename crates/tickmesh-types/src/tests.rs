//! Unit tests for tickmesh-types

use proptest::prelude::*;
use test_case::test_case;

use crate::{Direction, EventKind, EventRecord, LogEntry, LogicalTime, MachineId};

fn id(n: u32) -> MachineId {
    MachineId::new(n).unwrap()
}

// ============================================================================
// MachineId
// ============================================================================

#[test]
fn machine_id_rejects_zero() {
    assert!(MachineId::new(0).is_none());
    assert!(MachineId::try_from(0u32).is_err());
    assert_eq!(MachineId::try_from(4u32).unwrap().get(), 4);
}

#[test_case(0 => 1)]
#[test_case(1 => 2)]
#[test_case(9 => 10)]
fn machine_id_from_rank(rank: usize) -> u32 {
    MachineId::from_rank(rank).get()
}

#[test]
fn machine_id_log_file_names() {
    assert_eq!(id(3).log_file_name(), "machine_3.log");
    assert_eq!(MachineId::from_log_file_name("machine_12.log"), Some(id(12)));
    assert_eq!(MachineId::from_log_file_name("machine_0.log"), None);
    assert_eq!(MachineId::from_log_file_name("machine_x.log"), None);
    assert_eq!(MachineId::from_log_file_name("node_1.log"), None);
}

#[test]
fn machine_id_serializes_as_integer() {
    assert_eq!(serde_json::to_string(&id(3)).unwrap(), "3");
    assert_eq!(serde_json::from_str::<MachineId>("2").unwrap(), id(2));
    assert!(serde_json::from_str::<MachineId>("0").is_err());
    assert!(serde_json::from_str::<MachineId>("-1").is_err());
}

// ============================================================================
// LogicalTime
// ============================================================================

#[test]
fn logical_time_next_and_distance() {
    let t = LogicalTime::new(3);
    assert_eq!(t.next(), LogicalTime::new(4));
    assert_eq!(LogicalTime::new(7).ticks_since(t), 4);
    assert_eq!(t.ticks_since(LogicalTime::new(7)), 0);
    assert_eq!(LogicalTime::new(u64::MAX).next().as_u64(), u64::MAX);
}

proptest! {
    #[test]
    fn logical_time_ordering_matches_u64(a: u64, b: u64) {
        prop_assert_eq!(LogicalTime::new(a).cmp(&LogicalTime::new(b)), a.cmp(&b));
    }
}

// ============================================================================
// EventRecord
// ============================================================================

#[test]
fn receive_record_json_shape() {
    let record = EventRecord::Receive {
        sender: id(2),
        old_clock: LogicalTime::ZERO,
        sender_clock: LogicalTime::new(3),
        new_clock: LogicalTime::new(4),
        drift: 3,
        queue_length: 0,
    };

    let value: serde_json::Value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["type"], "receive");
    assert_eq!(value["sender"], 2);
    assert_eq!(value["old_clock"], 0);
    assert_eq!(value["sender_clock"], 3);
    assert_eq!(value["new_clock"], 4);
    assert_eq!(value["drift"], 3);
    assert_eq!(value["queue_length"], 0);
}

#[test]
fn send_record_lists_targets() {
    let json = r#"{"type":"send","targets":[1,3],"new_clock":9}"#;
    let record: EventRecord = serde_json::from_str(json).unwrap();
    assert_eq!(
        record,
        EventRecord::Send {
            targets: vec![id(1), id(3)],
            new_clock: LogicalTime::new(9),
        }
    );
    assert_eq!(record.kind(), EventKind::Send);
    assert!(record.is_cycle());
    assert_eq!(record.cycle_clock(), Some(LogicalTime::new(9)));
}

#[test]
fn lifecycle_records_are_not_cycles() {
    let records = [
        EventRecord::Startup {
            port: 5000,
            clock_rate: 3,
            peers: vec![id(2)],
        },
        EventRecord::Connected {
            peer: id(2),
            port: 5001,
            direction: Direction::Dialed,
        },
        EventRecord::DialFailed {
            port: 5002,
            attempts: 5,
        },
        EventRecord::Stopped {
            final_clock: LogicalTime::new(12),
        },
    ];

    for record in &records {
        assert!(!record.is_cycle(), "{record:?}");
        assert_eq!(record.cycle_clock(), None);
    }
}

#[test]
fn log_entry_round_trips_through_json() {
    let entry = LogEntry::now(
        id(1),
        EventRecord::Connected {
            peer: id(3),
            port: 5002,
            direction: Direction::Accepted,
        },
    );

    let line = serde_json::to_string(&entry).unwrap();
    assert!(!line.contains('\n'));
    assert!(line.contains(r#""direction":"accepted""#));

    let parsed: LogEntry = serde_json::from_str(&line).unwrap();
    assert_eq!(parsed, entry);
}
