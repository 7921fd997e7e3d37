//! The virtual machine and its lifecycle.
//!
//! # Lifecycle
//!
//! 1. [`VirtualMachine::start`] binds the listener and spawns the acceptor.
//! 2. [`VirtualMachine::connect`] waits the startup delay and dials every
//!    higher-port peer.
//! 3. [`VirtualMachine::run_until_stopped`] runs rate-limited cycles until a
//!    [`StopHandle`] asks it to stop.
//! 4. [`VirtualMachine::stop`] closes every socket, including streams still
//!    waiting for their handshake, then joins every thread parked on them.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use socket2::SockRef;
use tickmesh_types::{Direction, EventRecord, LogicalTime, MachineId};
use tracing::{Span, debug, info, info_span, warn};

use crate::channel::{PeerConnection, spawn_consumer};
use crate::clock::LogicalClock;
use crate::connection::{self, NoReclaim, PortReclaimer};
use crate::error::{DialError, MachineResult, RegisterError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::queue::InboundQueue;
use crate::rate_limiter::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::scheduler::{CycleContext, EventScheduler};
use crate::settings::MachineSettings;
use crate::sink::EventSink;
use crate::topology::Topology;
use crate::wire::{LineDecoder, encode_handshake};

/// Timeout for the loopback connection that wakes a blocked `accept`.
const WAKE_TIMEOUT: Duration = Duration::from_millis(200);

/// The listener clone kept for shutdown.
#[derive(Debug)]
struct ListenerControl {
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Accepted streams still waiting for their handshake line.
#[derive(Debug, Default)]
struct PendingHandshakes {
    next: u64,
    streams: BTreeMap<u64, TcpStream>,
}

/// State shared by the owning thread, the acceptor, consumers, and stop
/// handles.
pub(crate) struct Shared {
    pub(crate) id: MachineId,
    pub(crate) topology: Topology,
    pub(crate) clock: LogicalClock,
    pub(crate) queue: Arc<InboundQueue>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) lifecycle: Lifecycle,
    sink: Arc<dyn EventSink>,
    listener: Mutex<Option<ListenerControl>>,
    pending: Mutex<PendingHandshakes>,
    handshakes: Mutex<Vec<JoinHandle<()>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, record: &EventRecord) {
        self.sink.emit(self.id, record);
    }

    /// Registers a handshaken stream and starts its consumer.
    pub(crate) fn register(
        &self,
        stream: TcpStream,
        port: u16,
        direction: Direction,
        decoder: LineDecoder,
    ) -> Result<MachineId, RegisterError> {
        let peer = self
            .topology
            .machine_id(port)
            .ok_or(RegisterError::UnknownPeer(port))?;

        let (connection, reader) = PeerConnection::open(stream, port, peer, direction)?;
        self.registry
            .insert(Arc::clone(&connection))
            .map_err(RegisterError::Rejected)?;

        let handle = match spawn_consumer(
            self.id,
            Arc::clone(&connection),
            reader,
            decoder,
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.remove_if_same(&connection);
                connection.shutdown();
                return Err(e.into());
            }
        };
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        info!(peer = %peer, port, %direction, "peer connected");
        self.emit(&EventRecord::Connected {
            peer,
            port,
            direction,
        });
        Ok(peer)
    }

    /// Keeps a clone of `stream` so shutdown can close it mid-handshake.
    ///
    /// Returns `None` once stop has been requested; the stream must then be
    /// dropped.
    pub(crate) fn track_handshake(&self, stream: &TcpStream) -> io::Result<Option<u64>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.lifecycle.stop_requested() {
            return Ok(None);
        }
        let ticket = pending.next;
        pending.next += 1;
        pending.streams.insert(ticket, stream.try_clone()?);
        Ok(Some(ticket))
    }

    pub(crate) fn untrack_handshake(&self, ticket: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .streams
            .remove(&ticket);
    }

    /// Records a handshake thread, forgetting those already finished.
    pub(crate) fn push_handshake(&self, handle: JoinHandle<()>) {
        let mut handles = self.handshakes.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Requests stop and closes every socket. Safe to call repeatedly.
    fn shutdown(&self) {
        if self.lifecycle.request_stop() {
            debug!("stop requested");
        }
        if self.lifecycle.state() != LifecycleState::Created {
            self.lifecycle.advance(LifecycleState::Stopping);
        }

        // Stop is already requested, so nothing new can be tracked after this.
        let pending = std::mem::take(
            &mut self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .streams,
        );
        for stream in pending.values() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(error = %e, "pending handshake shutdown");
            }
        }

        let control = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(control) = control {
            // Wakes `accept` on Linux; the loopback connect covers the rest.
            if let Err(e) = SockRef::from(&control.listener).shutdown(Shutdown::Both) {
                debug!(error = %e, "listener shutdown");
            }
            if let Err(e) =
                TcpStream::connect_timeout(&wake_addr(control.local_addr), WAKE_TIMEOUT)
            {
                debug!(error = %e, "acceptor wake-up");
            }
        }

        let closed = self.registry.close_all();
        debug!(closed, "connections closed");
    }

    fn take_handshakes(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handshakes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn take_consumers(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Loopback equivalent of a wildcard listen address.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

/// Cloneable handle for stopping a machine from another thread.
///
/// Stopping closes the machine's sockets immediately; the owning thread
/// finishes the joins in [`VirtualMachine::stop`].
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.shutdown();
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.lifecycle.stop_requested()
    }

    pub fn machine(&self) -> MachineId {
        self.shared.id
    }

    pub fn clock(&self) -> LogicalTime {
        self.shared.clock.current()
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("machine", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of dialing the higher-port peers.
#[derive(Debug, Default)]
pub struct DialReport {
    /// Ports that connected, ascending.
    pub connected: Vec<u16>,
    /// Peers left unconnected.
    pub failed: Vec<DialError>,
}

impl DialReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One simulated machine.
pub struct VirtualMachine {
    settings: MachineSettings,
    shared: Arc<Shared>,
    reclaimer: Box<dyn PortReclaimer>,
    acceptor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    span: Span,
}

impl VirtualMachine {
    /// Creates a machine. Nothing is bound until [`VirtualMachine::start`].
    pub fn new(settings: MachineSettings, sink: Arc<dyn EventSink>) -> MachineResult<Self> {
        settings.validate()?;

        let topology = Topology::resolve(settings.port, settings.peers.iter().copied());
        let id = topology.self_id();
        let shared = Arc::new(Shared {
            id,
            topology,
            clock: LogicalClock::new(),
            queue: Arc::new(InboundQueue::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            lifecycle: Lifecycle::new(),
            sink,
            listener: Mutex::new(None),
            pending: Mutex::new(PendingHandshakes::default()),
            handshakes: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });

        Ok(Self {
            settings,
            shared,
            reclaimer: Box::new(NoReclaim),
            acceptor: None,
            local_addr: None,
            span: info_span!("machine", id = %id),
        })
    }

    /// Replaces the hook run between bind attempts.
    pub fn with_reclaimer(mut self, reclaimer: impl PortReclaimer + 'static) -> Self {
        self.reclaimer = Box::new(reclaimer);
        self
    }

    pub fn id(&self) -> MachineId {
        self.shared.id
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn clock(&self) -> LogicalTime {
        self.shared.clock.current()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Ports with a live connection, ascending.
    pub fn connected_peers(&self) -> Vec<u16> {
        self.shared.registry.ports()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Binds the listener and starts accepting lower-port peers.
    pub fn start(&mut self) -> MachineResult<SocketAddr> {
        let _span = self.span.clone().entered();
        self.shared.lifecycle.transition(
            "start",
            &[LifecycleState::Created],
            LifecycleState::Starting,
        )?;

        match self.bind_and_accept() {
            Ok(addr) => Ok(addr),
            Err(e) => {
                warn!(error = %e, "startup failed");
                self.shared.lifecycle.advance(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    fn bind_and_accept(&mut self) -> MachineResult<SocketAddr> {
        let addr = connection::resolve_addr(&self.settings.host, self.settings.port)?;
        let listener = connection::bind_listener(
            addr,
            &self.settings,
            self.reclaimer.as_ref(),
            &self.shared.lifecycle,
        )?;
        let local_addr = listener.local_addr()?;
        let control = listener.try_clone()?;
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ListenerControl {
            listener: control,
            local_addr,
        });

        let shared = Arc::clone(&self.shared);
        let span = self.span.clone();
        let handshake_timeout = self.settings.handshake_timeout;
        let acceptor = thread::Builder::new()
            .name(format!("tickmesh-{}-accept", self.shared.id))
            .spawn(move || {
                let _entered = span.entered();
                connection::run_acceptor(shared, listener, handshake_timeout);
            })?;
        self.acceptor = Some(acceptor);
        self.local_addr = Some(local_addr);

        let topology = &self.shared.topology;
        let peers = topology
            .peer_ports()
            .into_iter()
            .filter_map(|p| topology.machine_id(p))
            .collect();
        info!(%local_addr, clock_rate = self.settings.clock_rate, "listening");
        self.shared.emit(&EventRecord::Startup {
            port: self.settings.port,
            clock_rate: self.settings.clock_rate,
            peers,
        });

        Ok(local_addr)
    }

    /// Waits the startup delay, then dials every higher-port peer.
    ///
    /// Peers that cannot be reached are reported, not fatal.
    pub fn connect(&mut self) -> MachineResult<DialReport> {
        let _span = self.span.clone().entered();
        let mut report = DialReport::default();
        if self.shared.lifecycle.stop_requested() {
            return Ok(report);
        }
        self.shared.lifecycle.transition(
            "connect",
            &[LifecycleState::Starting],
            LifecycleState::Connecting,
        )?;

        let delay = self.settings.startup_delay(self.shared.id);
        debug!(delay_ms = delay.as_millis() as u64, "waiting before dialing");
        if !self.shared.lifecycle.sleep(delay) {
            return Ok(report);
        }

        for port in self.shared.topology.higher_peers() {
            match self.dial_peer(port) {
                Ok(attempts) => {
                    debug!(port, attempts, "dialed peer");
                    report.connected.push(port);
                }
                Err(e) => {
                    if let DialError::Exhausted { attempts, .. } = &e {
                        warn!(port, attempts, error = %e, "peer unreachable");
                        self.shared.emit(&EventRecord::DialFailed {
                            port,
                            attempts: *attempts,
                        });
                    } else {
                        warn!(port, error = %e, "peer not connected");
                    }
                    report.failed.push(e);
                }
            }
        }

        Ok(report)
    }

    fn dial_peer(&self, port: u16) -> Result<u32, DialError> {
        let addr = connection::resolve_addr(&self.settings.host, port).map_err(|source| {
            DialError::Exhausted {
                port,
                attempts: 0,
                source,
            }
        })?;
        let (mut stream, attempts) =
            connection::dial(addr, &self.settings, &self.shared.lifecycle)?;

        stream
            .write_all(encode_handshake(self.settings.port).as_bytes())
            .map_err(|source| DialError::Handshake { port, source })?;

        self.shared
            .register(stream, port, Direction::Dialed, LineDecoder::new())
            .map_err(|source| DialError::Register { port, source })?;
        Ok(attempts)
    }

    /// Runs cycles until stopped, then performs [`VirtualMachine::stop`].
    pub fn run_until_stopped(&mut self) -> MachineResult<()> {
        let _span = self.span.clone().entered();
        match self.shared.lifecycle.transition(
            "run",
            &[LifecycleState::Starting, LifecycleState::Connecting],
            LifecycleState::Running,
        ) {
            Ok(()) => info!(clock_rate = self.settings.clock_rate, "running"),
            Err(_) if self.shared.lifecycle.stop_requested() => {}
            Err(e) => return Err(e),
        }

        let shared = Arc::clone(&self.shared);
        let rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut scheduler = EventScheduler::new(rng, self.settings.thresholds);
        let mut limiter = RateLimiter::new(self.settings.clock_rate);
        let ctx = CycleContext {
            topology: &shared.topology,
            clock: &shared.clock,
            queue: &shared.queue,
            outbox: shared.registry.as_ref(),
        };

        while !shared.lifecycle.stop_requested() {
            if limiter.allow() {
                let record = scheduler.cycle(&ctx);
                shared.emit(&record);
            } else {
                thread::sleep(self.settings.idle_sleep);
            }
        }

        self.stop()
    }

    /// Starts, connects, and runs until stopped.
    pub fn run(&mut self) -> MachineResult<()> {
        self.start()?;
        let report = self.connect()?;
        if !report.is_complete() {
            warn!(
                connected = report.connected.len(),
                failed = report.failed.len(),
                "running with missing peers"
            );
        }
        self.run_until_stopped()
    }

    /// Closes every socket and joins every thread. A second call is a no-op.
    pub fn stop(&mut self) -> MachineResult<()> {
        let _span = self.span.clone().entered();
        match self.state() {
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Created => {
                self.shared.lifecycle.request_stop();
                self.shared.lifecycle.advance(LifecycleState::Stopped);
                return Ok(());
            }
            _ => {}
        }

        self.shared.shutdown();

        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("acceptor thread panicked");
            }
        }
        // Handshake threads may still register consumers, so join them first.
        for handshake in self.shared.take_handshakes() {
            if handshake.join().is_err() {
                warn!("handshake thread panicked");
            }
        }
        for consumer in self.shared.take_consumers() {
            if consumer.join().is_err() {
                warn!("consumer thread panicked");
            }
        }

        self.shared.lifecycle.advance(LifecycleState::Stopped);
        let final_clock = self.shared.clock.current();
        info!(%final_clock, "stopped");
        self.shared.emit(&EventRecord::Stopped { final_clock });
        Ok(())
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Stopped {
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.shared.id)
            .field("port", &self.settings.port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
