//! Machine identity derived from the set of listening ports.
//!
//! Every machine resolves the same port set independently. Sorting the ports
//! and numbering them from 1 gives all of them the same labels without any
//! coordination.

use tickmesh_types::MachineId;

/// Sorted port set with 1-indexed machine IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Ascending, deduplicated, includes `self_port`.
    ports: Vec<u16>,
    self_port: u16,
    self_rank: usize,
}

impl Topology {
    /// Resolves the topology for a machine listening on `self_port`.
    ///
    /// Duplicate ports (including `self_port` appearing among the peers)
    /// collapse into one entry.
    pub fn resolve(self_port: u16, peer_ports: impl IntoIterator<Item = u16>) -> Self {
        let mut ports: Vec<u16> = peer_ports.into_iter().collect();
        ports.push(self_port);
        ports.sort_unstable();
        ports.dedup();

        let self_rank = ports.partition_point(|&p| p < self_port);

        Self {
            ports,
            self_port,
            self_rank,
        }
    }

    /// ID assigned to `port`, if it belongs to this topology.
    pub fn machine_id(&self, port: u16) -> Option<MachineId> {
        self.ports
            .binary_search(&port)
            .ok()
            .map(MachineId::from_rank)
    }

    /// Port owned by `id`, if any.
    pub fn port_of(&self, id: MachineId) -> Option<u16> {
        let rank = usize::try_from(id.get() - 1).ok()?;
        self.ports.get(rank).copied()
    }

    pub fn self_id(&self) -> MachineId {
        MachineId::from_rank(self.self_rank)
    }

    pub fn self_port(&self) -> u16 {
        self.self_port
    }

    /// Every port except our own, ascending.
    pub fn peer_ports(&self) -> Vec<u16> {
        self.ports
            .iter()
            .copied()
            .filter(|&p| p != self.self_port)
            .collect()
    }

    /// Peers this machine dials (ports above its own), ascending.
    pub fn higher_peers(&self) -> Vec<u16> {
        self.ports[self.self_rank + 1..].to_vec()
    }

    /// Peers that dial this machine (ports below its own), ascending.
    pub fn lower_peers(&self) -> Vec<u16> {
        self.ports[..self.self_rank].to_vec()
    }

    /// `(port, id)` for every machine, including self, ascending.
    pub fn entries(&self) -> impl Iterator<Item = (u16, MachineId)> + '_ {
        self.ports
            .iter()
            .enumerate()
            .map(|(rank, &port)| (port, MachineId::from_rank(rank)))
    }

    /// Number of machines, including self.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Always false: a topology contains at least its own port.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
