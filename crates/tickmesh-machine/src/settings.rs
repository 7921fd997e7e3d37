//! Plain configuration value consumed by a machine.

use std::time::Duration;

use tickmesh_types::MachineId;

use crate::error::{MachineError, MachineResult};
use crate::scheduler::EventThresholds;

/// Everything a [`crate::VirtualMachine`] needs to run.
///
/// Built by the caller; the machine never reads the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSettings {
    /// Host to bind and to dial peers on.
    pub host: String,
    pub port: u16,
    pub peers: Vec<u16>,
    /// Cycles per second.
    pub clock_rate: u32,
    /// Attempts for binding and for dialing each peer.
    pub max_retries: u32,
    /// Delay between bind attempts and the first dial backoff.
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub startup_base_delay: Duration,
    pub startup_per_machine_factor: Duration,
    pub reuse_port: bool,
    pub thresholds: EventThresholds,
    /// Sleep when the rate limiter refuses a cycle.
    pub idle_sleep: Duration,
    /// Seed for the event draw; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl MachineSettings {
    /// Settings with the stock timings for a machine on `port`.
    pub fn new(port: u16, peers: impl IntoIterator<Item = u16>, clock_rate: u32) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            peers: peers.into_iter().collect(),
            clock_rate,
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            startup_base_delay: Duration::from_secs(1),
            startup_per_machine_factor: Duration::from_millis(500),
            reuse_port: false,
            thresholds: EventThresholds::default(),
            idle_sleep: Duration::from_millis(100),
            seed: None,
        }
    }

    /// Wait before dialing: `startup_base_delay + factor * id`.
    pub fn startup_delay(&self, id: MachineId) -> Duration {
        self.startup_base_delay
            .saturating_add(self.startup_per_machine_factor.saturating_mul(id.get()))
    }

    pub fn validate(&self) -> MachineResult<()> {
        let invalid = |msg: String| Err(MachineError::InvalidSettings(msg));

        if self.clock_rate == 0 {
            return invalid("clock_rate must be >= 1".to_string());
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be >= 1".to_string());
        }
        if self.host.trim().is_empty() {
            return invalid("host must not be empty".to_string());
        }
        let t = &self.thresholds;
        if t.draw_min > t.draw_max {
            return invalid(format!(
                "draw range {}..={} is empty",
                t.draw_min, t.draw_max
            ));
        }
        if t.send_to_first > t.send_to_second || t.send_to_second > t.send_to_all {
            return invalid("event thresholds must be non-decreasing".to_string());
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout must be positive".to_string());
        }
        if self.handshake_timeout.is_zero() {
            return invalid("handshake_timeout must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn startup_delay_scales_with_id() {
        let settings = MachineSettings::new(5000, [5001], 1);
        let id = MachineId::new(3).unwrap();
        assert_eq!(settings.startup_delay(id), Duration::from_millis(2500));
    }

    #[test]
    fn stock_settings_are_valid() {
        assert!(MachineSettings::new(5000, [5001], 3).validate().is_ok());
    }

    #[test_case(|s: &mut MachineSettings| s.clock_rate = 0 ; "zero rate")]
    #[test_case(|s: &mut MachineSettings| s.max_retries = 0 ; "no retries")]
    #[test_case(|s: &mut MachineSettings| s.host = " ".to_string() ; "blank host")]
    #[test_case(|s: &mut MachineSettings| s.thresholds.draw_min = 20 ; "empty draw range")]
    #[test_case(|s: &mut MachineSettings| s.connect_timeout = Duration::ZERO ; "zero connect timeout")]
    #[test_case(|s: &mut MachineSettings| s.handshake_timeout = Duration::ZERO ; "zero handshake timeout")]
    fn validation_rejects(mutate: fn(&mut MachineSettings)) {
        let mut settings = MachineSettings::new(5000, [5001], 3);
        mutate(&mut settings);
        assert!(matches!(
            settings.validate(),
            Err(MachineError::InvalidSettings(_))
        ));
    }
}
