//! Binding, accepting, and dialing.
//!
//! For any two machines the lower port dials and the higher port accepts.
//! The dialer identifies itself with a single `CONNECT <port>` line; the
//! acceptor drops anything that is not a known lower-port peer.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tickmesh_types::Direction;
use tracing::{Span, debug, info, warn};

use crate::error::{DialError, MachineError, MachineResult, RegisterError};
use crate::lifecycle::Lifecycle;
use crate::machine::Shared;
use crate::settings::MachineSettings;
use crate::wire::{FrameError, LineDecoder, parse_handshake};

/// Listen backlog for the accepting socket.
const BACKLOG: i32 = 128;

/// A handshake line is `CONNECT ` plus at most five digits.
const MAX_HANDSHAKE_LEN: usize = 64;

/// Pause after a failed `accept` so a persistent error cannot spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

// ============================================================================
// Port reclaim
// ============================================================================

/// Hook run between bind attempts when the port is in use.
pub trait PortReclaimer: Send + Sync {
    fn reclaim(&self, port: u16);
}

/// Does nothing; bind simply retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReclaim;

impl PortReclaimer for NoReclaim {
    fn reclaim(&self, _port: u16) {}
}

/// Kills whichever process holds the port, found with `lsof`.
///
/// Unix only; elsewhere it logs and does nothing. Never kills the current
/// process.
#[derive(Debug, Default, Clone, Copy)]
pub struct KillPortHolder;

impl PortReclaimer for KillPortHolder {
    fn reclaim(&self, port: u16) {
        if !cfg!(unix) {
            debug!(port, "port reclaim unsupported on this platform");
            return;
        }

        let output = match Command::new("lsof").arg("-ti").arg(format!(":{port}")).output() {
            Ok(output) => output,
            Err(e) => {
                warn!(port, error = %e, "failed to run lsof");
                return;
            }
        };

        let own_pid = std::process::id().to_string();
        for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
            if pid == own_pid {
                continue;
            }
            match Command::new("kill").arg("-9").arg(pid).status() {
                Ok(status) if status.success() => warn!(port, pid, "killed process holding port"),
                Ok(status) => debug!(port, pid, %status, "kill failed"),
                Err(e) => warn!(port, pid, error = %e, "failed to run kill"),
            }
        }
    }
}

// ============================================================================
// Bind
// ============================================================================

/// Resolves `host:port`, taking the first address.
pub fn resolve_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}:{port}"),
        )
    })
}

fn try_bind(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        set_reuse_port(&socket)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> io::Result<()> {
    debug!("SO_REUSEPORT unavailable, skipping");
    Ok(())
}

/// Binds the listening socket, retrying while the address is in use.
///
/// Any other bind error fails immediately.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    settings: &MachineSettings,
    reclaimer: &dyn PortReclaimer,
    lifecycle: &Lifecycle,
) -> MachineResult<TcpListener> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_bind(addr, settings.reuse_port) {
            Ok(listener) => return Ok(listener),
            Err(e)
                if e.kind() == io::ErrorKind::AddrInUse
                    && attempt < settings.max_retries
                    && !lifecycle.stop_requested() =>
            {
                warn!(%addr, attempt, max = settings.max_retries, "address in use, retrying bind");
                reclaimer.reclaim(addr.port());
                lifecycle.sleep(settings.retry_delay);
            }
            Err(source) => {
                return Err(MachineError::Bind {
                    addr: addr.to_string(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

// ============================================================================
// Dial
// ============================================================================

/// Connects to `addr`, doubling the backoff after each failure.
///
/// Returns the stream and the number of attempts it took.
pub(crate) fn dial(
    addr: SocketAddr,
    settings: &MachineSettings,
    lifecycle: &Lifecycle,
) -> Result<(TcpStream, u32), DialError> {
    let port = addr.port();
    let mut backoff = settings.retry_delay;
    let mut attempt = 0;

    loop {
        if lifecycle.stop_requested() {
            return Err(DialError::Cancelled { port });
        }
        attempt += 1;

        match TcpStream::connect_timeout(&addr, settings.connect_timeout) {
            Ok(stream) => return Ok((stream, attempt)),
            Err(source) if attempt >= settings.max_retries => {
                return Err(DialError::Exhausted {
                    port,
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                debug!(%addr, attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "dial failed, backing off");
                if !lifecycle.sleep(backoff) {
                    return Err(DialError::Cancelled { port });
                }
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}

// ============================================================================
// Accept
// ============================================================================

/// Why an incoming connection was dropped.
#[derive(Debug, Error)]
pub(crate) enum HandshakeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("closed before handshake")]
    Closed,

    #[error("no handshake within {0:?}")]
    TimedOut(Duration),

    #[error("handshake line too long")]
    Oversized,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("port {0} must not dial this machine")]
    NotLower(u16),

    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Reads exactly one handshake line. Bytes after it stay in the decoder.
pub(crate) fn read_handshake(
    stream: &mut TcpStream,
    timeout: Duration,
) -> Result<(u16, LineDecoder), HandshakeError> {
    let deadline = Instant::now() + timeout;
    let mut decoder = LineDecoder::new();
    let mut chunk = [0u8; MAX_HANDSHAKE_LEN];

    loop {
        if let Some(line) = decoder.next_line() {
            return Ok((parse_handshake(&line)?, decoder));
        }
        if decoder.buffered() > MAX_HANDSHAKE_LEN {
            return Err(HandshakeError::Oversized);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HandshakeError::TimedOut(timeout));
        }
        stream.set_read_timeout(Some(remaining))?;

        match stream.read(&mut chunk) {
            Ok(0) => return Err(HandshakeError::Closed),
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(HandshakeError::TimedOut(timeout));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn accept_peer(
    shared: &Shared,
    mut stream: TcpStream,
    timeout: Duration,
) -> Result<(), HandshakeError> {
    let (port, decoder) = read_handshake(&mut stream, timeout)?;
    if port >= shared.topology.self_port() {
        return Err(HandshakeError::NotLower(port));
    }
    stream.set_read_timeout(None)?;
    shared.register(stream, port, Direction::Accepted, decoder)?;
    Ok(())
}

/// Reads the handshake of one accepted stream on its own thread.
///
/// The stream stays tracked by `shared` until the handshake ends, so a stop
/// closes it even while the read is blocked.
fn spawn_handshake(
    shared: &Arc<Shared>,
    stream: TcpStream,
    timeout: Duration,
) -> io::Result<()> {
    let remote = stream.peer_addr().ok();
    let name = match remote {
        Some(addr) => format!("tickmesh-{}-handshake-{}", shared.id, addr.port()),
        None => format!("tickmesh-{}-handshake", shared.id),
    };
    let worker = Arc::clone(shared);
    let span = Span::current();

    let handle = thread::Builder::new().name(name).spawn(move || {
        let _entered = span.entered();
        let ticket = match worker.track_handshake(&stream) {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return,
            Err(e) => {
                debug!(?remote, error = %e, "dropped incoming connection");
                return;
            }
        };

        let result = accept_peer(&worker, stream, timeout);
        worker.untrack_handshake(ticket);
        if let Err(e) = result {
            debug!(?remote, error = %e, "dropped incoming connection");
        }
    })?;
    shared.push_handshake(handle);
    Ok(())
}

/// Accept loop. Runs until stop is requested and the listener is closed.
pub(crate) fn run_acceptor(shared: Arc<Shared>, listener: TcpListener, handshake_timeout: Duration) {
    for incoming in listener.incoming() {
        if shared.lifecycle.stop_requested() {
            break;
        }

        match incoming {
            Ok(stream) => {
                if let Err(e) = spawn_handshake(&shared, stream, handshake_timeout) {
                    warn!(error = %e, "could not start handshake thread");
                }
            }
            Err(e) => {
                if shared.lifecycle.stop_requested() {
                    break;
                }
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }

    info!("acceptor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn fast_settings(max_retries: u32) -> MachineSettings {
        let mut settings = MachineSettings::new(0, [], 1);
        settings.max_retries = max_retries;
        settings.retry_delay = Duration::from_millis(10);
        settings.connect_timeout = Duration::from_millis(200);
        settings
    }

    #[test]
    fn handshake_keeps_trailing_bytes() {
        let (mut client, mut server) = pair();
        client
            .write_all(b"CONNECT 5000\n{\"sender\":1,\"clock\":1}\n")
            .unwrap();

        let (port, mut decoder) = read_handshake(&mut server, Duration::from_secs(2)).unwrap();

        assert_eq!(port, 5000);
        // The message may arrive in the same read or a later one.
        if let Some(line) = decoder.next_line() {
            assert_eq!(&line[..], b"{\"sender\":1,\"clock\":1}");
        }
    }

    #[test]
    fn handshake_times_out() {
        let (_client, mut server) = pair();
        let err = read_handshake(&mut server, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, HandshakeError::TimedOut(_)));
    }

    #[test]
    fn handshake_rejects_early_close_and_garbage() {
        let (client, mut server) = pair();
        drop(client);
        assert!(matches!(
            read_handshake(&mut server, Duration::from_secs(2)),
            Err(HandshakeError::Closed)
        ));

        let (mut client, mut server) = pair();
        client.write_all(b"HELLO\n").unwrap();
        assert!(matches!(
            read_handshake(&mut server, Duration::from_secs(2)),
            Err(HandshakeError::Frame(_))
        ));
    }

    #[test]
    fn bind_fails_after_retries_when_port_held() {
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();
        let lifecycle = Lifecycle::new();

        let err = bind_listener(addr, &fast_settings(2), &NoReclaim, &lifecycle).unwrap_err();

        match err {
            MachineError::Bind { attempts, source, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dial_exhausts_retries_on_refused_port() {
        // Bind then drop to find a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let lifecycle = Lifecycle::new();

        let err = dial(addr, &fast_settings(3), &lifecycle).unwrap_err();

        assert!(matches!(err, DialError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.port(), addr.port());
    }

    #[test]
    fn dial_is_cancelled_by_stop() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let lifecycle = Lifecycle::new();
        lifecycle.request_stop();

        let err = dial(addr, &fast_settings(3), &lifecycle).unwrap_err();
        assert!(matches!(err, DialError::Cancelled { .. }));
    }

    #[test]
    fn resolves_localhost() {
        let addr = resolve_addr("localhost", 5000).unwrap();
        assert_eq!(addr.port(), 5000);
        assert!(addr.ip().is_loopback());
    }
}
