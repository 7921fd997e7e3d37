//! Configuration management for tickmesh
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (`TICKMESH_<SECTION>__<KEY>`)
//! 3. tickmesh.local.toml (gitignored, local overrides)
//! 4. tickmesh.toml (git-tracked, project config)
//! 5. ~/.config/tickmesh/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{ConfigLayer, Paths};

/// Main tickmesh configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickmeshConfig {
    pub network: NetworkConfig,
    pub machine: MachineConfig,
    pub connect: ConnectConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

/// Size and addressing of the simulated network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Number of virtual machines.
    pub machines: u16,
    /// Machine `i` (0-based) listens on `base_port + i`.
    pub base_port: u16,
    /// Host used both for binding and dialing.
    pub host: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            machines: 3,
            base_port: 5000,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Ports of every machine, ascending.
    pub fn ports(&self) -> Vec<u16> {
        (0..self.machines).map(|i| self.base_port + i).collect()
    }
}

/// Per-machine execution parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Lower bound for the randomly chosen clock rate (cycles per second).
    pub min_clock_rate: u32,
    /// Upper bound for the randomly chosen clock rate.
    pub max_clock_rate: u32,
    /// Fixed clock rates, one per machine. Empty means random.
    pub clock_rates: Vec<u32>,
    /// Sleep between rate limiter checks once the budget is spent.
    pub idle_sleep_ms: u64,
    /// Base seed; machine `i` uses `seed + i`. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            min_clock_rate: 1,
            max_clock_rate: 6,
            clock_rates: Vec::new(),
            idle_sleep_ms: 100,
            seed: None,
        }
    }
}

impl MachineConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

/// Bind, dial, and startup timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Attempts for both binding and dialing each peer.
    pub max_retries: u32,
    /// Delay between bind attempts; initial dial backoff (doubles per failure).
    pub retry_delay_ms: u64,
    /// Per-attempt dial timeout.
    pub connect_timeout_ms: u64,
    /// How long the acceptor waits for a `CONNECT` line.
    pub handshake_timeout_ms: u64,
    /// Delay before dialing, plus `startup_per_machine_factor_ms * machine_id`.
    pub startup_base_delay_ms: u64,
    pub startup_per_machine_factor_ms: u64,
    /// Set `SO_REUSEPORT` on the listening socket.
    pub reuse_port: bool,
    /// Kill whatever holds a busy port between bind attempts (unix only).
    pub reclaim_port: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 1000,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            startup_base_delay_ms: 1000,
            startup_per_machine_factor_ms: 500,
            reuse_port: false,
            reclaim_port: false,
        }
    }
}

impl ConnectConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn startup_base_delay(&self) -> Duration {
        Duration::from_millis(self.startup_base_delay_ms)
    }

    pub fn startup_per_machine_factor(&self) -> Duration {
        Duration::from_millis(self.startup_per_machine_factor_ms)
    }
}

/// Random event draw: a value in `draw_min..=draw_max` is compared against
/// cumulative thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub draw_min: u32,
    pub draw_max: u32,
    /// `draw <= send_to_first` sends to the lowest-port peer.
    pub send_to_first: u32,
    /// `draw <= send_to_second` sends to the second-lowest-port peer.
    pub send_to_second: u32,
    /// `draw <= send_to_all` sends to every peer; anything above is internal.
    pub send_to_all: u32,
}

impl Default for EventsConfig {
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory receiving `machine_<id>.log` files.
    pub directory: PathBuf,
    /// Default tracing level (overridden by `RUST_LOG`).
    pub level: String,
    /// Console output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl TickmeshConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// A configuration with no startup delays and short retry timings,
    /// suited to running on a single host.
    pub fn local_fast() -> Self {
        Self {
            connect: ConnectConfig {
                retry_delay_ms: 50,
                connect_timeout_ms: 500,
                handshake_timeout_ms: 1000,
                startup_base_delay_ms: 0,
                startup_per_machine_factor_ms: 0,
                ..Default::default()
            },
            machine: MachineConfig {
                idle_sleep_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.network.machines == 0 {
            return invalid("network.machines must be >= 1".to_string());
        }
        if u32::from(self.network.base_port) + u32::from(self.network.machines) - 1
            > u32::from(u16::MAX)
        {
            return invalid(format!(
                "port range {}..{} exceeds 65535",
                self.network.base_port,
                u32::from(self.network.base_port) + u32::from(self.network.machines)
            ));
        }
        if self.network.host.trim().is_empty() {
            return invalid("network.host must not be empty".to_string());
        }

        let machine = &self.machine;
        if machine.min_clock_rate == 0 {
            return invalid("machine.min_clock_rate must be >= 1".to_string());
        }
        if machine.min_clock_rate > machine.max_clock_rate {
            return invalid(format!(
                "machine.min_clock_rate ({}) exceeds machine.max_clock_rate ({})",
                machine.min_clock_rate, machine.max_clock_rate
            ));
        }
        if !machine.clock_rates.is_empty() {
            if machine.clock_rates.len() != usize::from(self.network.machines) {
                return invalid(format!(
                    "machine.clock_rates has {} entries for {} machines",
                    machine.clock_rates.len(),
                    self.network.machines
                ));
            }
            if machine.clock_rates.contains(&0) {
                return invalid("machine.clock_rates entries must be >= 1".to_string());
            }
        }

        if self.connect.max_retries == 0 {
            return invalid("connect.max_retries must be >= 1".to_string());
        }
        if self.connect.connect_timeout_ms == 0 {
            return invalid("connect.connect_timeout_ms must be >= 1".to_string());
        }
        if self.connect.handshake_timeout_ms == 0 {
            return invalid("connect.handshake_timeout_ms must be >= 1".to_string());
        }

        let events = &self.events;
        if events.draw_min > events.draw_max {
            return invalid(format!(
                "events.draw_min ({}) exceeds events.draw_max ({})",
                events.draw_min, events.draw_max
            ));
        }
        if events.send_to_first > events.send_to_second
            || events.send_to_second > events.send_to_all
        {
            return invalid(format!(
                "event thresholds must be non-decreasing (got {}, {}, {})",
                events.send_to_first, events.send_to_second, events.send_to_all
            ));
        }

        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        if self.logging.directory.is_relative() {
            self.logging.directory = base_dir.as_ref().join(&self.logging.directory);
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = TickmeshConfig::default();
        assert_eq!(config.network.machines, 3);
        assert_eq!(config.network.base_port, 5000);
        assert_eq!(config.machine.min_clock_rate, 1);
        assert_eq!(config.machine.max_clock_rate, 6);
        assert_eq!(config.connect.max_retries, 5);
        assert_eq!(config.events.draw_max, 10);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ports() {
        let config = TickmeshConfig::default();
        assert_eq!(config.network.ports(), vec![5000, 5001, 5002]);
    }

    #[test]
    fn test_local_fast_has_no_startup_delay() {
        let config = TickmeshConfig::local_fast();
        assert_eq!(config.connect.startup_base_delay(), Duration::ZERO);
        assert_eq!(config.connect.startup_per_machine_factor(), Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test_case(|c: &mut TickmeshConfig| c.network.machines = 0 ; "zero machines")]
    #[test_case(|c: &mut TickmeshConfig| c.network.base_port = 65534 ; "port overflow")]
    #[test_case(|c: &mut TickmeshConfig| c.machine.min_clock_rate = 0 ; "zero rate")]
    #[test_case(|c: &mut TickmeshConfig| c.machine.min_clock_rate = 9 ; "min above max")]
    #[test_case(|c: &mut TickmeshConfig| c.machine.clock_rates = vec![2, 4] ; "rate count mismatch")]
    #[test_case(|c: &mut TickmeshConfig| c.machine.clock_rates = vec![2, 0, 6] ; "zero fixed rate")]
    #[test_case(|c: &mut TickmeshConfig| c.connect.max_retries = 0 ; "no retries")]
    #[test_case(|c: &mut TickmeshConfig| c.connect.connect_timeout_ms = 0 ; "zero connect timeout")]
    #[test_case(|c: &mut TickmeshConfig| c.connect.handshake_timeout_ms = 0 ; "zero handshake timeout")]
    #[test_case(|c: &mut TickmeshConfig| c.events.draw_min = 11 ; "empty draw range")]
    #[test_case(|c: &mut TickmeshConfig| c.events.send_to_second = 0 ; "decreasing thresholds")]
    fn test_validation_rejects(mutate: fn(&mut TickmeshConfig)) {
        let mut config = TickmeshConfig::default();
        mutate(&mut config);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_fixed_rates_accepted() {
        let mut config = TickmeshConfig::default();
        config.machine.clock_rates = vec![2, 4, 6];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_resolution() {
        let mut config = TickmeshConfig::default();
        config.resolve_paths("/home/user/project");

        assert_eq!(
            config.logging.directory,
            PathBuf::from("/home/user/project/logs")
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = TickmeshConfig::default();
        config.machine.seed = Some(7);
        config.machine.clock_rates = vec![2, 4, 6];

        let rendered = config.to_toml().unwrap();
        let parsed: TickmeshConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
