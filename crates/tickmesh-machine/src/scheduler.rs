//! Per-cycle event decisions.
//!
//! A cycle first drains one queued message. Only when the queue is empty
//! does it draw a random number and pick a send or an internal event.

use rand::Rng;
use tickmesh_types::EventRecord;
use tracing::debug;

use crate::clock::LogicalClock;
use crate::queue::InboundQueue;
use crate::registry::Outbox;
use crate::topology::Topology;
use crate::wire::Message;

/// Draw range and cumulative thresholds for random events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventThresholds {
    pub draw_min: u32,
    pub draw_max: u32,
    pub send_to_first: u32,
    pub send_to_second: u32,
    pub send_to_all: u32,
}

impl Default for EventThresholds {
    fn default() -> Self {
        Self {
            draw_min: 1,
            draw_max: 10,
            send_to_first: 1,
            send_to_second: 2,
            send_to_all: 3,
        }
    }
}

/// Outcome of a random draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send to the lowest-port peer.
    SendFirst,
    /// Send to the second-lowest-port peer.
    SendSecond,
    /// Send to every peer.
    SendAll,
    Internal,
}

/// Classifies `draw` for a machine with `peer_count` peers.
///
/// Sends that need more peers than exist become internal events.
pub fn classify(draw: u32, thresholds: &EventThresholds, peer_count: usize) -> Action {
    let action = if draw <= thresholds.send_to_first {
        Action::SendFirst
    } else if draw <= thresholds.send_to_second {
        Action::SendSecond
    } else if draw <= thresholds.send_to_all {
        Action::SendAll
    } else {
        Action::Internal
    };

    match action {
        Action::SendFirst | Action::SendAll if peer_count == 0 => Action::Internal,
        Action::SendSecond if peer_count < 2 => Action::Internal,
        other => other,
    }
}

/// Ports an action sends to, given ascending peer ports.
fn targets(action: Action, peers: &[u16]) -> Vec<u16> {
    match action {
        Action::SendFirst => peers.iter().take(1).copied().collect(),
        Action::SendSecond => peers.iter().skip(1).take(1).copied().collect(),
        Action::SendAll => peers.to_vec(),
        Action::Internal => Vec::new(),
    }
}

/// Machine state a cycle reads and updates.
pub struct CycleContext<'a> {
    pub topology: &'a Topology,
    pub clock: &'a LogicalClock,
    pub queue: &'a InboundQueue,
    pub outbox: &'a dyn Outbox,
}

/// Runs cycles using a caller-supplied random source.
pub struct EventScheduler<R> {
    rng: R,
    thresholds: EventThresholds,
}

impl<R: Rng> EventScheduler<R> {
    pub fn new(rng: R, thresholds: EventThresholds) -> Self {
        Self { rng, thresholds }
    }

    /// Performs one cycle and returns its record.
    pub fn cycle(&mut self, ctx: &CycleContext<'_>) -> EventRecord {
        if let Some(message) = ctx.queue.pop() {
            let observation = ctx.clock.observe(message.clock);
            return EventRecord::Receive {
                sender: message.sender,
                old_clock: observation.before,
                sender_clock: message.clock,
                new_clock: observation.after,
                drift: observation.drift(),
                queue_length: ctx.queue.len(),
            };
        }

        let draw = self
            .rng
            .gen_range(self.thresholds.draw_min..=self.thresholds.draw_max);
        let peers = ctx.topology.peer_ports();

        match classify(draw, &self.thresholds, peers.len()) {
            Action::Internal => EventRecord::Internal {
                new_clock: ctx.clock.tick(),
            },
            action => {
                let new_clock = ctx.clock.tick();
                let message = Message {
                    sender: ctx.topology.self_id(),
                    clock: new_clock,
                };

                let mut delivered = Vec::new();
                for port in targets(action, &peers) {
                    match ctx.outbox.send(port, &message) {
                        Ok(()) => delivered.extend(ctx.topology.machine_id(port)),
                        Err(e) => debug!(port, error = %e, "send skipped"),
                    }
                }

                EventRecord::Send {
                    targets: delivered,
                    new_clock,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use test_case::test_case;
    use tickmesh_types::{LogicalTime, MachineId};

    /// Records sends; ports in `down` fail as not connected.
    #[derive(Default)]
    struct RecordingOutbox {
        sent: RefCell<Vec<(u16, Message)>>,
        down: BTreeSet<u16>,
    }

    impl Outbox for RecordingOutbox {
        fn send(&self, port: u16, message: &Message) -> Result<(), SendError> {
            if self.down.contains(&port) {
                return Err(SendError::NotConnected(port));
            }
            self.sent.borrow_mut().push((port, *message));
            Ok(())
        }
    }

    fn id(n: u32) -> MachineId {
        MachineId::new(n).unwrap()
    }

    /// Thresholds whose draw range is the single value `draw`.
    fn fixed_draw(draw: u32) -> EventThresholds {
        EventThresholds {
            draw_min: draw,
            draw_max: draw,
            ..EventThresholds::default()
        }
    }

    #[test_case(1, 2 => Action::SendFirst)]
    #[test_case(2, 2 => Action::SendSecond)]
    #[test_case(3, 2 => Action::SendAll)]
    #[test_case(4, 2 => Action::Internal)]
    #[test_case(10, 2 => Action::Internal)]
    #[test_case(2, 1 => Action::Internal ; "second peer missing")]
    #[test_case(1, 1 => Action::SendFirst ; "single peer first")]
    #[test_case(3, 1 => Action::SendAll ; "single peer all")]
    #[test_case(1, 0 => Action::Internal ; "no peers first")]
    #[test_case(3, 0 => Action::Internal ; "no peers all")]
    fn classify_defaults(draw: u32, peers: usize) -> Action {
        classify(draw, &EventThresholds::default(), peers)
    }

    #[test]
    fn classify_cumulative_thresholds() {
        let thresholds = EventThresholds {
            draw_min: 1,
            draw_max: 100,
            send_to_first: 10,
            send_to_second: 20,
            send_to_all: 25,
        };
        assert_eq!(classify(7, &thresholds, 3), Action::SendFirst);
        assert_eq!(classify(11, &thresholds, 3), Action::SendSecond);
        assert_eq!(classify(25, &thresholds, 3), Action::SendAll);
        assert_eq!(classify(26, &thresholds, 3), Action::Internal);
    }

    #[test]
    fn receive_takes_priority_and_applies_lamport_rule() {
        // Machine 3 of ports 5000..=5002 receives machine 2's clock 3.
        let topology = Topology::resolve(5002, [5000, 5001]);
        let clock = LogicalClock::new();
        let queue = InboundQueue::new();
        let outbox = RecordingOutbox::default();
        queue.push(Message {
            sender: id(2),
            clock: LogicalTime::new(3),
        });

        let ctx = CycleContext {
            topology: &topology,
            clock: &clock,
            queue: &queue,
            outbox: &outbox,
        };
        let mut scheduler = EventScheduler::new(StdRng::seed_from_u64(1), fixed_draw(1));

        assert_eq!(
            scheduler.cycle(&ctx),
            EventRecord::Receive {
                sender: id(2),
                old_clock: LogicalTime::ZERO,
                sender_clock: LogicalTime::new(3),
                new_clock: LogicalTime::new(4),
                drift: 3,
                queue_length: 0,
            }
        );
        assert!(outbox.sent.borrow().is_empty());
    }

    #[test_case(1, &[5001] ; "first")]
    #[test_case(2, &[5002] ; "second")]
    #[test_case(3, &[5001, 5002] ; "all")]
    fn send_targets_follow_sorted_peer_ports(draw: u32, expected: &[u16]) {
        let topology = Topology::resolve(5000, [5002, 5001]);
        let clock = LogicalClock::new();
        let queue = InboundQueue::new();
        let outbox = RecordingOutbox::default();
        let ctx = CycleContext {
            topology: &topology,
            clock: &clock,
            queue: &queue,
            outbox: &outbox,
        };
        let mut scheduler = EventScheduler::new(StdRng::seed_from_u64(1), fixed_draw(draw));

        let record = scheduler.cycle(&ctx);

        let sent: Vec<u16> = outbox.sent.borrow().iter().map(|(p, _)| *p).collect();
        assert_eq!(sent, expected);
        for (_, message) in outbox.sent.borrow().iter() {
            assert_eq!(message.sender, id(1));
            assert_eq!(message.clock, LogicalTime::new(1));
        }
        let EventRecord::Send { targets, new_clock } = record else {
            panic!("expected send, got {record:?}");
        };
        assert_eq!(new_clock, LogicalTime::new(1));
        let expected_ids: Vec<_> = expected
            .iter()
            .map(|&p| topology.machine_id(p).unwrap())
            .collect();
        assert_eq!(targets, expected_ids);
    }

    #[test]
    fn failed_targets_are_left_out_of_record() {
        let topology = Topology::resolve(5000, [5001, 5002]);
        let clock = LogicalClock::new();
        let queue = InboundQueue::new();
        let outbox = RecordingOutbox {
            down: BTreeSet::from([5001]),
            ..RecordingOutbox::default()
        };
        let ctx = CycleContext {
            topology: &topology,
            clock: &clock,
            queue: &queue,
            outbox: &outbox,
        };
        let mut scheduler = EventScheduler::new(StdRng::seed_from_u64(1), fixed_draw(3));

        let record = scheduler.cycle(&ctx);

        assert_eq!(
            record,
            EventRecord::Send {
                targets: vec![id(3)],
                new_clock: LogicalTime::new(1),
            }
        );
    }

    #[test]
    fn internal_event_ticks_once() {
        let topology = Topology::resolve(5000, [5001, 5002]);
        let clock = LogicalClock::new();
        let queue = InboundQueue::new();
        let outbox = RecordingOutbox::default();
        let ctx = CycleContext {
            topology: &topology,
            clock: &clock,
            queue: &queue,
            outbox: &outbox,
        };
        let mut scheduler = EventScheduler::new(StdRng::seed_from_u64(1), fixed_draw(9));

        for expected in 1..=3 {
            assert_eq!(
                scheduler.cycle(&ctx),
                EventRecord::Internal {
                    new_clock: LogicalTime::new(expected),
                }
            );
        }
        assert!(outbox.sent.borrow().is_empty());
    }

    #[test]
    fn seeded_schedulers_agree() {
        let topology = Topology::resolve(5000, [5001, 5002]);
        let run = || {
            let clock = LogicalClock::new();
            let queue = InboundQueue::new();
            let outbox = RecordingOutbox::default();
            let ctx = CycleContext {
                topology: &topology,
                clock: &clock,
                queue: &queue,
                outbox: &outbox,
            };
            let mut scheduler =
                EventScheduler::new(StdRng::seed_from_u64(42), EventThresholds::default());
            (0..50).map(|_| scheduler.cycle(&ctx)).collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }
}
