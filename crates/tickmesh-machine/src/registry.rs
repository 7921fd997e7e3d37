//! Active connections, keyed by peer port.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::channel::PeerConnection;
use crate::error::SendError;
use crate::wire::Message;

/// Where the event scheduler sends messages.
pub trait Outbox {
    /// Sends `message` to the peer listening on `port`.
    fn send(&self, port: u16, message: &Message) -> Result<(), SendError>;
}

/// Why a connection was not registered. The connection has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A connection to this peer already exists.
    Duplicate,
    /// The machine is shutting down.
    Closed,
}

impl Rejection {
    pub fn reason(self) -> &'static str {
        match self {
            Rejection::Duplicate => "peer already connected",
            Rejection::Closed => "machine is shutting down",
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: BTreeMap<u16, Arc<PeerConnection>>,
    closed: bool,
}

/// At most one live connection per peer port.
///
/// Once [`ConnectionRegistry::close_all`] runs, every later insert is
/// refused and the offered connection is shut down.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `connection` under its peer port.
    pub fn insert(&self, connection: Arc<PeerConnection>) -> Result<(), Rejection> {
        let rejection = {
            let mut state = self.state();
            if state.closed {
                Rejection::Closed
            } else if state.connections.contains_key(&connection.port()) {
                Rejection::Duplicate
            } else {
                state.connections.insert(connection.port(), connection);
                return Ok(());
            }
        };
        connection.shutdown();
        Err(rejection)
    }

    pub fn get(&self, port: u16) -> Option<Arc<PeerConnection>> {
        self.state().connections.get(&port).cloned()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.state().connections.contains_key(&port)
    }

    /// Removes `connection` if it is still the registered one for its port.
    pub fn remove_if_same(&self, connection: &Arc<PeerConnection>) -> bool {
        let mut state = self.state();
        let same = state
            .connections
            .get(&connection.port())
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if same {
            state.connections.remove(&connection.port());
        }
        same
    }

    /// Connected peer ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        self.state().connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().connections.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Refuses further inserts and shuts down every connection.
    ///
    /// Returns how many connections were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state();
            state.closed = true;
            std::mem::take(&mut state.connections).into_values().collect()
        };
        for connection in &drained {
            connection.shutdown();
        }
        drained.len()
    }
}

impl Outbox for ConnectionRegistry {
    fn send(&self, port: u16, message: &Message) -> Result<(), SendError> {
        let connection = self.get(port).ok_or(SendError::NotConnected(port))?;

        connection.send(message).inspect_err(|e| {
            if matches!(e, SendError::Io { .. }) {
                debug!(port, error = %e, "removing broken connection");
                self.remove_if_same(&connection);
                connection.shutdown();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::{TcpListener, TcpStream};
    use tickmesh_types::{Direction, LogicalTime, MachineId};

    /// Returns a connection registered as `port` plus the remote end.
    fn connected_pair(port: u16) -> (Arc<PeerConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (remote, _) = listener.accept().unwrap();
        let (connection, _reader) =
            PeerConnection::open(local, port, MachineId::FIRST, Direction::Dialed).unwrap();
        (connection, remote)
    }

    fn message(clock: u64) -> Message {
        Message {
            sender: MachineId::FIRST,
            clock: LogicalTime::new(clock),
        }
    }

    #[test]
    fn rejects_duplicate_peer() {
        let registry = ConnectionRegistry::new();
        let (first, _r1) = connected_pair(5001);
        let (second, _r2) = connected_pair(5001);

        assert_eq!(registry.insert(first), Ok(()));
        assert_eq!(registry.insert(second), Err(Rejection::Duplicate));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn refuses_inserts_after_close() {
        let registry = ConnectionRegistry::new();
        let (first, _r1) = connected_pair(5001);
        registry.insert(first).unwrap();

        assert_eq!(registry.close_all(), 1);
        assert!(registry.is_empty());

        let (late, _r2) = connected_pair(5002);
        assert_eq!(registry.insert(late), Err(Rejection::Closed));
        assert!(registry.is_closed());
    }

    #[test]
    fn remove_if_same_ignores_replaced_connection() {
        let registry = ConnectionRegistry::new();
        let (stale, _r1) = connected_pair(5001);
        let (current, _r2) = connected_pair(5001);

        registry.insert(Arc::clone(&current)).unwrap();
        assert!(!registry.remove_if_same(&stale));
        assert!(registry.contains(5001));
        assert!(registry.remove_if_same(&current));
        assert!(!registry.contains(5001));
    }

    #[test]
    fn send_to_unknown_peer_is_not_connected() {
        let registry = ConnectionRegistry::new();
        let err = registry.send(6000, &message(1)).unwrap_err();
        assert!(matches!(err, SendError::NotConnected(6000)));
    }

    #[test]
    fn send_writes_one_frame() {
        let registry = ConnectionRegistry::new();
        let (connection, remote) = connected_pair(5001);
        registry.insert(connection).unwrap();

        registry.send(5001, &message(7)).unwrap();

        let mut line = String::new();
        BufReader::new(remote).read_line(&mut line).unwrap();
        assert_eq!(line, "{\"sender\":1,\"clock\":7}\n");
    }

    #[test]
    fn failed_send_removes_connection() {
        let registry = ConnectionRegistry::new();
        let (connection, _remote) = connected_pair(5001);
        connection.shutdown();
        registry.insert(connection).unwrap();

        let err = registry.send(5001, &message(1)).unwrap_err();
        assert!(matches!(err, SendError::Io { port: 5001, .. }));
        assert!(!registry.contains(5001));
        assert!(matches!(
            registry.send(5001, &message(2)),
            Err(SendError::NotConnected(5001))
        ));
    }
}
