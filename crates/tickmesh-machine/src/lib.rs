//! # tickmesh-machine: Lamport-clock virtual machines over TCP
//!
//! Each [`VirtualMachine`] listens on one port, connects to every other
//! machine in its port set, and runs a rate-limited loop that either
//! receives a queued message or generates a random send or internal event,
//! updating its [`LogicalClock`] by Lamport's rules.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          VirtualMachine                            │
//! │                                                                    │
//! │  acceptor thread          consumer threads (one per peer)          │
//! │  ┌──────────────┐         ┌──────────────┐                         │
//! │  │ accept       │──────▶  │ LineDecoder  │──┐                      │
//! │  │ CONNECT <p>  │         └──────────────┘  │                      │
//! │  └──────────────┘         ┌──────────────┐  │  ┌──────────────┐    │
//! │  dialer (owner thread)    │ LineDecoder  │──┼─▶│ InboundQueue │    │
//! │  ┌──────────────┐──────▶  └──────────────┘  │  └──────┬───────┘    │
//! │  │ dial + retry │                          ...         │            │
//! │  └──────────────┘                                      ▼            │
//! │                ┌─────────────┐   ┌──────────────────────────────┐  │
//! │                │ RateLimiter │──▶│ EventScheduler::cycle        │  │
//! │                └─────────────┘   │ receive / send / internal    │  │
//! │                                  └──────┬──────────────┬────────┘  │
//! │                                         ▼              ▼           │
//! │                               ConnectionRegistry   EventSink       │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocking sockets and OS threads throughout. Stopping closes every socket,
//! which is what releases threads parked in `accept` or `read`.

mod channel;
mod clock;
mod connection;
mod error;
mod lifecycle;
mod machine;
mod queue;
mod rate_limiter;
mod registry;
mod scheduler;
mod settings;
mod sink;
mod topology;
pub mod wire;

pub use channel::{PeerConnection, PumpStats, pump};
pub use clock::{LogicalClock, Observation};
pub use connection::{KillPortHolder, NoReclaim, PortReclaimer, resolve_addr};
pub use error::{DialError, MachineError, MachineResult, RegisterError, SendError};
pub use lifecycle::LifecycleState;
pub use machine::{DialReport, StopHandle, VirtualMachine};
pub use queue::InboundQueue;
pub use rate_limiter::{RateLimiter, WINDOW};
pub use registry::{ConnectionRegistry, Outbox, Rejection};
pub use scheduler::{Action, CycleContext, EventScheduler, EventThresholds, classify};
pub use settings::MachineSettings;
pub use sink::{EventSink, FanoutSink, JsonLinesSink, MemorySink, TracingSink};
pub use topology::Topology;
pub use wire::{Message, MAX_FRAME_LEN};
