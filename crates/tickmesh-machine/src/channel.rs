//! Per-peer connections and their receive loops.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tickmesh_types::{Direction, MachineId};
use tracing::{debug, info_span, trace, warn};

use crate::error::SendError;
use crate::queue::InboundQueue;
use crate::registry::ConnectionRegistry;
use crate::wire::{LineDecoder, Message, decode_message, encode_message};

/// Size of the stack buffer used for each socket read.
const READ_CHUNK: usize = 4096;

/// An established connection to one peer.
///
/// Writes go through a mutex so each frame reaches the socket whole. A
/// separate handle is kept for shutdown, which never waits on that mutex.
#[derive(Debug)]
pub struct PeerConnection {
    port: u16,
    peer: MachineId,
    direction: Direction,
    writer: Mutex<TcpStream>,
    control: TcpStream,
}

impl PeerConnection {
    /// Wraps `stream`, returning the connection and a handle for its reader.
    pub fn open(
        stream: TcpStream,
        port: u16,
        peer: MachineId,
        direction: Direction,
    ) -> io::Result<(Arc<Self>, TcpStream)> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let connection = Arc::new(Self {
            port,
            peer,
            direction,
            writer: Mutex::new(stream),
            control,
        });
        Ok((connection, reader))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer(&self) -> MachineId {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Writes one framed message.
    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        let frame = encode_message(message)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(&frame)
            .and_then(|()| writer.flush())
            .map_err(|source| SendError::Io {
                port: self.port,
                source,
            })
    }

    /// Closes both directions, waking any thread blocked reading.
    pub fn shutdown(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            trace!(port = self.port, error = %e, "shutdown on closed socket");
        }
    }
}

/// Counters from one receive loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub delivered: u64,
    pub malformed: u64,
    pub oversized: u64,
}

/// Reads `reader` until end of stream, pushing every well-formed frame.
///
/// Lines already buffered in `decoder` are delivered first. Malformed frames
/// are counted and dropped. Returns the first read error other than
/// `Interrupted`; a clean end of stream returns `Ok`.
pub fn pump<R: Read>(
    reader: &mut R,
    decoder: &mut LineDecoder,
    queue: &InboundQueue,
) -> (PumpStats, io::Result<()>) {
    let mut stats = PumpStats::default();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        while let Some(line) = decoder.next_line() {
            match decode_message(&line) {
                Ok(message) => {
                    queue.push(message);
                    stats.delivered += 1;
                }
                Err(e) => {
                    debug!(error = %e, "dropping malformed frame");
                    stats.malformed += 1;
                }
            }
        }
        stats.oversized = decoder.oversized();

        match reader.read(&mut chunk) {
            Ok(0) => return (stats, Ok(())),
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (stats, Err(e)),
        }
    }
}

/// Starts the receive loop for `connection` on its own thread.
///
/// When the loop ends the connection is shut down and removed from
/// `registry`, unless a different connection has replaced it.
pub(crate) fn spawn_consumer(
    machine: MachineId,
    connection: Arc<PeerConnection>,
    mut reader: TcpStream,
    mut decoder: LineDecoder,
    queue: Arc<InboundQueue>,
    registry: Arc<ConnectionRegistry>,
) -> io::Result<JoinHandle<()>> {
    let name = format!("tickmesh-{machine}-peer-{}", connection.port());

    thread::Builder::new().name(name).spawn(move || {
        let span = info_span!("consumer", machine = %machine, peer = %connection.peer());
        let _guard = span.enter();

        let (stats, result) = pump(&mut reader, &mut decoder, &queue);
        match result {
            Ok(()) => debug!(?stats, "peer closed connection"),
            Err(e) if registry.is_closed() => debug!(?stats, error = %e, "read ended by shutdown"),
            Err(e) => warn!(?stats, error = %e, "read failed, dropping connection"),
        }

        registry.remove_if_same(&connection);
        connection.shutdown();
    })
}
