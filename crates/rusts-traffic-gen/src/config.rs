//! Run configuration for the traffic generator.
//!
//! A [`RunConfig`] is built once (defaults, then an optional YAML file, then
//! command line overrides), validated, and shared read-only by every worker
//! for the lifetime of the run.

use crate::connection::ConnectionPolicy;
use crate::error::{Result, TrafficError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Identity used by the single worker spawned in hotspot mode.
pub const HOTSPOT_SENSOR_ID: &str = "hot_sensor";

/// Returns the identity of the sensor with the given index (e.g. `sensor_000042`).
pub fn sensor_identity(index: usize) -> String {
    format!("sensor_{:06}", index)
}

/// Complete run configuration - can be loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Storage nodes to contact (host or host:port)
    pub hosts: Vec<String>,
    /// Keyspace holding the telemetry table
    pub keyspace: String,
    /// Telemetry table name
    pub table: String,
    /// Number of concurrent sensor workers
    pub workers: usize,
    /// Base operations per second per worker (one operation = one metric set)
    pub base_ops: u32,
    /// Probability that a single sample is corrupted
    pub fault_probability: f64,
    /// Relative jitter bound applied to the tick interval
    pub jitter: f64,
    /// Size of the sensor identity space targeted by reads
    pub num_sensors: usize,
    /// Run duration in minutes (None = until interrupted)
    pub duration_minutes: Option<u64>,
    /// Stress mode switches
    pub modes: ModeFlags,
    /// Which backend implementation to drive
    pub backend: BackendKind,
    /// Timing and sizing knobs
    pub tuning: TuningSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["storage".to_string()],
            keyspace: "sensor_traffic".to_string(),
            table: "telemetry_data".to_string(),
            workers: 20,
            base_ops: 50,
            fault_probability: 0.01,
            jitter: 0.3,
            num_sensors: 1000,
            duration_minutes: None,
            modes: ModeFlags::default(),
            backend: BackendKind::Http,
            tuning: TuningSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Stress mode switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeFlags {
    /// Issue one bounded read per tick against a random sensor
    pub read_storm: bool,
    /// Run a single worker on the hotspot identity
    pub hotspot: bool,
    /// Open a fresh connection every tick
    pub connection_storm: bool,
    /// Burn CPU every tick
    pub cpu_spike: bool,
    /// Never close storm connections
    pub leak_mode: bool,
}

/// Backend implementation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// RusTs-style HTTP gateway
    Http,
    /// In-process backend, useful for dry runs
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(BackendKind::Http),
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

/// Timing and sizing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningSettings {
    /// Pause after a failed connection attempt before retrying the tick
    pub connect_backoff_ms: u64,
    /// Workers spawned between two startup pauses
    pub spawn_batch_size: usize,
    /// Startup pause between spawn batches
    pub spawn_pause_ms: u64,
    /// Supervisor liveness log interval
    pub poll_interval_secs: u64,
    /// Grace period for workers to exit once the run is over
    pub join_timeout_secs: u64,
    /// Iterations of the CPU spike loop
    pub cpu_spike_iterations: u64,
    /// Floor for the per-tick sleep
    pub min_sleep_ms: u64,
    /// HTTP request timeout
    pub request_timeout_secs: u64,
    /// Rows kept per sensor by the in-memory backend
    pub memory_retention_rows: usize,
    /// Seed for reproducible runs (None = entropy)
    pub seed: Option<u64>,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            connect_backoff_ms: 1000,
            spawn_batch_size: 100,
            spawn_pause_ms: 100,
            poll_interval_secs: 10,
            join_timeout_secs: 5,
            cpu_spike_iterations: 5_000_000,
            min_sleep_ms: 1,
            request_timeout_secs: 10,
            memory_retention_rows: 1_000,
            seed: None,
        }
    }
}

/// Format of the fault audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditFormat {
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Operational log file (None = console only)
    pub log_file: Option<String>,
    /// Fault audit log file
    pub fault_log_file: String,
    /// Fault audit line format
    pub audit_format: AuditFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: Some("telemetry.log".to_string()),
            fault_log_file: "faults.log".to_string(),
            audit_format: AuditFormat::Text,
        }
    }
}

impl RunConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: RunConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Write the default configuration to a YAML file
    pub fn write_default(path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(&Self::default())?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Checks the parameters that would otherwise make the run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(TrafficError::Config("at least one host is required".into()));
        }
        if self.base_ops == 0 {
            return Err(TrafficError::Config("base_ops must be greater than zero".into()));
        }
        if !(0.0..=1.0).contains(&self.fault_probability) {
            return Err(TrafficError::Config(format!(
                "fault_probability must be within [0, 1], got {}",
                self.fault_probability
            )));
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(TrafficError::Config(format!(
                "jitter must be a non-negative number, got {}",
                self.jitter
            )));
        }
        if self.workers == 0 && !self.modes.hotspot {
            return Err(TrafficError::Config("workers must be greater than zero".into()));
        }
        if self.num_sensors == 0 && self.modes.read_storm {
            return Err(TrafficError::Config(
                "num_sensors must be greater than zero when read storm is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Connection policy derived from the storm and leak flags.
    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::from_flags(self.modes.connection_storm, self.modes.leak_mode)
    }

    /// Configured run duration, if any.
    pub fn duration(&self) -> Option<Duration> {
        self.duration_minutes
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
    }

    /// Nominal interval between two ticks of one worker.
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.base_ops.max(1) as f64)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.tuning.connect_backoff_ms)
    }

    pub fn spawn_pause(&self) -> Duration {
        Duration::from_millis(self.tuning.spawn_pause_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.tuning.poll_interval_secs.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.join_timeout_secs)
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.tuning.min_sleep_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.request_timeout_secs)
    }

    /// Seed for the worker at `index`, when the run is seeded.
    pub fn worker_seed(&self, index: usize) -> Option<u64> {
        self.tuning
            .seed
            .map(|seed| seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Convert log level string to tracing Level
    pub fn log_level(&self) -> Level {
        match self.logging.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}
