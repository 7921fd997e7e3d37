//! Cluster layout and per-machine settings.

use rand::Rng;
use tickmesh_config::TickmeshConfig;
use tickmesh_machine::{EventThresholds, MachineSettings};
use tickmesh_types::MachineId;

use crate::{Error, Result};

/// Layout of a cluster: machine `i` listens on `base_port + i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPlan {
    /// First port.
    pub base_port: u16,
    /// One entry per machine, by ascending port.
    pub machines: Vec<MachinePlan>,
}

/// One machine in a [`ClusterPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachinePlan {
    pub id: MachineId,
    pub port: u16,
    /// Every other machine's port, ascending.
    pub peers: Vec<u16>,
}

impl ClusterPlan {
    /// Lays out `machines` machines starting at `base_port`.
    pub fn new(machines: usize, base_port: u16) -> Result<Self> {
        if machines == 0 {
            return Err(Error::InvalidMachineCount(machines));
        }
        let last = usize::from(base_port) + machines - 1;
        if last > usize::from(u16::MAX) {
            return Err(Error::InvalidPortRange(base_port, machines));
        }

        let ports: Vec<u16> = (0..machines).map(|i| base_port + i as u16).collect();
        let machines = ports
            .iter()
            .enumerate()
            .map(|(rank, &port)| MachinePlan {
                id: MachineId::from_rank(rank),
                port,
                peers: ports.iter().copied().filter(|&p| p != port).collect(),
            })
            .collect();

        Ok(Self {
            base_port,
            machines,
        })
    }

    /// Plan matching `config.network`.
    pub fn from_config(config: &TickmeshConfig) -> Result<Self> {
        Self::new(usize::from(config.network.machines), config.network.base_port)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.machines.iter().map(|m| m.port).collect()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn machine(&self, id: MachineId) -> Option<&MachinePlan> {
        self.machines.iter().find(|m| m.id == id)
    }

    /// Picks one clock rate per machine.
    ///
    /// Uses `machine.clock_rates` when set, otherwise draws uniformly from
    /// `min_clock_rate..=max_clock_rate`.
    pub fn clock_rates<R: Rng>(&self, config: &TickmeshConfig, rng: &mut R) -> Result<Vec<u32>> {
        let fixed = &config.machine.clock_rates;
        if !fixed.is_empty() {
            if fixed.len() != self.len() {
                return Err(Error::ClockRateCount {
                    expected: self.len(),
                    actual: fixed.len(),
                });
            }
            return Ok(fixed.clone());
        }

        let (min, max) = (config.machine.min_clock_rate, config.machine.max_clock_rate);
        Ok(self.machines.iter().map(|_| rng.gen_range(min..=max)).collect())
    }

    /// Settings for every machine, in plan order.
    pub fn settings<R: Rng>(
        &self,
        config: &TickmeshConfig,
        rng: &mut R,
    ) -> Result<Vec<MachineSettings>> {
        let rates = self.clock_rates(config, rng)?;
        self.settings_with_rates(config, &rates)
    }

    /// Settings for every machine using already chosen clock rates.
    pub fn settings_with_rates(
        &self,
        config: &TickmeshConfig,
        rates: &[u32],
    ) -> Result<Vec<MachineSettings>> {
        if rates.len() != self.len() {
            return Err(Error::ClockRateCount {
                expected: self.len(),
                actual: rates.len(),
            });
        }
        Ok(self
            .machines
            .iter()
            .zip(rates.iter().copied())
            .enumerate()
            .map(|(rank, (plan, rate))| {
                let seed = config.machine.seed.map(|s| s.wrapping_add(rank as u64));
                machine_settings(config, plan.port, plan.peers.clone(), rate, seed)
            })
            .collect())
    }
}

/// Maps configuration onto the settings of one machine.
pub fn machine_settings(
    config: &TickmeshConfig,
    port: u16,
    peers: Vec<u16>,
    clock_rate: u32,
    seed: Option<u64>,
) -> MachineSettings {
    let connect = &config.connect;
    let events = &config.events;

    MachineSettings {
        host: config.network.host.clone(),
        port,
        peers,
        clock_rate,
        max_retries: connect.max_retries,
        retry_delay: connect.retry_delay(),
        connect_timeout: connect.connect_timeout(),
        handshake_timeout: connect.handshake_timeout(),
        startup_base_delay: connect.startup_base_delay(),
        startup_per_machine_factor: connect.startup_per_machine_factor(),
        reuse_port: connect.reuse_port,
        thresholds: EventThresholds {
            draw_min: events.draw_min,
            draw_max: events.draw_max,
            send_to_first: events.send_to_first,
            send_to_second: events.send_to_second,
            send_to_all: events.send_to_all,
        },
        idle_sleep: config.machine.idle_sleep(),
        seed,
    }
}
