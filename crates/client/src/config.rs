use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Deserialize;

use tinytel::{
    ConfigError, DEFAULT_PORT, HeartbeatPolicy, ImpairmentConfig, ReadingProfile, RetryPolicy,
    SessionConfig,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSection {
    pub warm_up_secs: u64,
    pub period_secs: u64,
    pub reply_timeout_ms: u64,
    pub miss_threshold: u32,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            warm_up_secs: 5,
            period_secs: 30,
            reply_timeout_ms: 5000,
            miss_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_timeout_ms: 1000,
            max_timeout_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImpairmentSection {
    pub enabled: bool,
    pub loss_probability: f64,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    pub reorder_probability: f64,
}

impl Default for ImpairmentSection {
    fn default() -> Self {
        let defaults = ImpairmentConfig::default();
        Self {
            enabled: defaults.enabled,
            loss_probability: defaults.loss_probability,
            base_delay_ms: defaults.base_delay_ms,
            jitter_ms: defaults.jitter_ms,
            reorder_probability: defaults.reorder_probability,
        }
    }
}

/// Settings for the simulated device fleet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub collector: String,
    pub device_ids: Vec<u16>,
    pub run_duration_secs: u64,
    pub settle_delay_ms: u64,
    pub data_interval_ms: u64,
    /// Upper bound on waiting for delayed packets to leave before the process exits.
    pub drain_timeout_ms: u64,
    pub report_path: Option<PathBuf>,
    pub heartbeat: HeartbeatSection,
    pub retry: RetrySection,
    pub impairment: ImpairmentSection,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            collector: format!("127.0.0.1:{}", DEFAULT_PORT),
            device_ids: vec![101, 102, 103],
            run_duration_secs: 50,
            settle_delay_ms: 2000,
            data_interval_ms: 4000,
            drain_timeout_ms: 2000,
            report_path: None,
            heartbeat: HeartbeatSection::default(),
            retry: RetrySection::default(),
            impairment: ImpairmentSection::default(),
        }
    }
}

impl FleetConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn collector_addr(&self) -> anyhow::Result<SocketAddr> {
        self.collector
            .to_socket_addrs()
            .with_context(|| format!("resolving collector {}", self.collector))?
            .next()
            .ok_or_else(|| anyhow!("collector {} resolved to no address", self.collector))
    }

    pub fn impairment(&self) -> ImpairmentConfig {
        ImpairmentConfig {
            enabled: self.impairment.enabled,
            loss_probability: self.impairment.loss_probability,
            base_delay_ms: self.impairment.base_delay_ms,
            jitter_ms: self.impairment.jitter_ms,
            reorder_probability: self.impairment.reorder_probability,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn session(&self, device_id: u16, collector: SocketAddr) -> SessionConfig {
        SessionConfig {
            device_id,
            collector,
            run_duration: Duration::from_secs(self.run_duration_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            data_interval: Duration::from_millis(self.data_interval_ms),
            heartbeat: HeartbeatPolicy {
                warm_up: Duration::from_secs(self.heartbeat.warm_up_secs),
                period: Duration::from_secs(self.heartbeat.period_secs),
                reply_timeout: Duration::from_millis(self.heartbeat.reply_timeout_ms),
                miss_threshold: self.heartbeat.miss_threshold,
            },
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_timeout: Duration::from_millis(self.retry.initial_timeout_ms),
                max_timeout: Duration::from_millis(self.retry.max_timeout_ms),
            },
            profile: ReadingProfile::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_ids.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        let mut seen = HashSet::new();
        for &id in &self.device_ids {
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateDevice(id));
            }
        }
        self.impairment().validate()?;

        let placeholder = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT));
        self.session(self.device_ids[0], placeholder).validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_session_defaults() {
        let config = FleetConfig::default();
        let collector = config.collector_addr().unwrap();
        let session = config.session(101, collector);

        assert_eq!(session, SessionConfig::new(101, collector));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_sections_from_toml() {
        let config: FleetConfig = toml::from_str(
            r#"
            device_ids = [7, 8]

            [impairment]
            enabled = true
            loss_probability = 0.2
            base_delay_ms = 40

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.device_ids, vec![7, 8]);
        assert!(config.impairment().simulates_delay());
        assert_eq!(config.impairment().reorder_probability, 0.3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_timeout_ms, 1000);
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let config = FleetConfig {
            device_ids: vec![1, 2, 1],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::DuplicateDevice(1)));
    }

    #[test]
    fn test_bad_loss_probability_rejected() {
        let mut config = FleetConfig::default();
        config.impairment.loss_probability = 2.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ProbabilityOutOfRange { .. })
        ));
    }
}
