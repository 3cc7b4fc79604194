use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use tinytel::{ConfigError, DEFAULT_FLUSH_THRESHOLD, DEFAULT_PORT, IngestConfig};

/// Collector settings. Every field may be omitted from the TOML file; command-line flags are
/// applied on top afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    pub bind: String,
    pub port: u16,
    /// Seconds before the collector shuts itself down; 0 runs until Ctrl-C or a
    /// stop from the dashboard.
    pub run_duration_secs: u64,
    pub poll_interval_ms: u64,
    pub flush_threshold: usize,
    /// Elapsed seconds at which a metrics checkpoint is logged.
    pub checkpoints_secs: Vec<u64>,
    /// A device that has sent nothing for this long is flagged silent on the dashboard.
    pub silent_after_secs: u64,
    pub sink_path: PathBuf,
    pub report_path: Option<PathBuf>,
    pub headless: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            run_duration_secs: 60,
            poll_interval_ms: 500,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            checkpoints_secs: vec![15, 30, 45],
            silent_after_secs: 35,
            sink_path: PathBuf::from("telemetry_log.csv"),
            report_path: None,
            headless: false,
        }
    }
}

impl CollectorConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn run_duration(&self) -> Option<Duration> {
        (self.run_duration_secs > 0).then(|| Duration::from_secs(self.run_duration_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn silent_after(&self) -> Duration {
        Duration::from_secs(self.silent_after_secs)
    }

    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            flush_threshold: self.flush_threshold,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll_interval_ms"));
        }
        self.ingest().validate()
    }
}
