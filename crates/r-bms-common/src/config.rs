//! ---
//! bms_section: "04-configuration-orchestration"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Typed runtime configuration loaded from TOML."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::{resolve_filter, ComponentLevels, LogFormat, LogRotation};

/// Smallest flush chunk accepted for the data log.
pub const MIN_CHUNK_SIZE: usize = 256;

fn default_bms_port() -> String {
    "/dev/ttyUSB0".to_owned()
}

fn default_esc_port() -> String {
    "/dev/ttyUSB1".to_owned()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_true() -> bool {
    true
}

fn default_staleness_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_mirrored() -> Vec<String> {
    names(&[
        "unknown7",
        "temperatures",
        "battery_voltage",
        "battery_percent",
        "bms_status",
    ])
}

fn default_fast_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_slow_divider() -> u32 {
    5
}

fn default_fast_parameters() -> Vec<String> {
    names(&[
        "battery_voltage",
        "battery_current",
        "remaining_capacity",
        "statistics",
    ])
}

fn default_slow_parameters() -> Vec<String> {
    names(&[
        "unknown7",
        "temperatures",
        "battery_percent",
        "bms_status",
        "total_capacity",
        "charge_cycles",
        "history",
        "cell_voltages1",
    ])
}

fn default_retries() -> u32 {
    3
}

// 9600 baud moves roughly 960 B/s, so 200 ms covers about 192 bytes.
fn default_receive_timeout() -> Duration {
    Duration::from_millis(200)
}

// Long enough not to flood the bus, short enough to keep the BMS out of
// standby, which it enters after about 3 s without traffic.
fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_datalog_directory() -> PathBuf {
    PathBuf::from("target/datalog")
}

fn default_chunk_size() -> usize {
    4096
}

fn default_queue_capacity() -> usize {
    256
}

fn default_file_prefix() -> String {
    "log".to_owned()
}

fn default_failure_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

/// Primary configuration object for the R-BMS runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bms: SerialPortConfig,
    #[serde(default)]
    pub esc: EscConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub datalog: DataLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_BMS_CONFIG";

    /// Load configuration from disk, respecting the `R_BMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.polling.validate()?;
        self.driver.validate()?;
        self.datalog.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Serial line settings for one RS485 bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortConfig {
    #[serde(default = "default_bms_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl Default for SerialPortConfig {
    fn default() -> Self {
        Self {
            port: default_bms_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// Settings for the bus on which the BMS is impersonated toward the ESC.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_esc_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Requests are left unanswered once the cached data is older than this.
    #[serde(default = "default_staleness_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub staleness_timeout: Duration,
    /// Registers copied from the poller into the bridge cache.
    #[serde(default = "default_mirrored")]
    pub mirrored: Vec<String>,
    /// Republish status frames sent by the ESC as their own log category.
    #[serde(default = "default_true")]
    pub observe_status: bool,
}

impl EscConfig {
    pub fn serial(&self) -> SerialPortConfig {
        SerialPortConfig {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
        }
    }
}

impl Default for EscConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_esc_port(),
            baud_rate: default_baud_rate(),
            staleness_timeout: default_staleness_timeout(),
            mirrored: default_mirrored(),
            observe_status: true,
        }
    }
}

/// Two-tier polling schedule.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_fast_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub fast_interval: Duration,
    /// The slow set is read on every Nth fast tick.
    #[serde(default = "default_slow_divider")]
    pub slow_divider: u32,
    #[serde(default = "default_fast_parameters")]
    pub fast: Vec<String>,
    #[serde(default = "default_slow_parameters")]
    pub slow: Vec<String>,
}

impl PollingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fast.is_empty() {
            return Err(anyhow!("polling.fast must name at least one parameter"));
        }
        if self.slow_divider == 0 {
            return Err(anyhow!("polling.slow_divider must be at least 1"));
        }
        if self.fast_interval.is_zero() {
            return Err(anyhow!("polling.fast_interval must be non-zero"));
        }
        let fast: BTreeSet<&str> = self.fast.iter().map(String::as_str).collect();
        if let Some(shared) = self.slow.iter().find(|name| fast.contains(name.as_str())) {
            return Err(anyhow!(
                "parameter '{}' is listed in both polling.fast and polling.slow",
                shared
            ));
        }
        Ok(())
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval: default_fast_interval(),
            slow_divider: default_slow_divider(),
            fast: default_fast_parameters(),
            slow: default_slow_parameters(),
        }
    }
}

/// Retry policy for request/response exchanges.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_receive_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub receive_timeout: Duration,
    #[serde(default = "default_retry_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(anyhow!("driver.retries must be at least 1"));
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            receive_timeout: default_receive_timeout(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Binary data log settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLogConfig {
    #[serde(default = "default_datalog_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_failure_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub failure_backoff: Duration,
}

impl DataLogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(anyhow!(
                "datalog.chunk_size must be at least {} bytes",
                MIN_CHUNK_SIZE
            ));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("datalog.queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl Default for DataLogConfig {
    fn default() -> Self {
        Self {
            directory: default_datalog_directory(),
            chunk_size: default_chunk_size(),
            queue_capacity: default_queue_capacity(),
            file_prefix: default_file_prefix(),
            failure_backoff: default_failure_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level for everything without a component override.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub components: ComponentLevels,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub rotation: LogRotation,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    /// File name stem; the service name when unset.
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        resolve_filter(self, None).map(|_| ())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            components: ComponentLevels::default(),
            format: default_log_format(),
            rotation: LogRotation::default(),
            directory: default_logging_directory(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.bms.baud_rate, 9600);
        assert_eq!(config.polling.fast_interval, Duration::from_secs(1));
        assert_eq!(config.polling.slow_divider, 5);
        assert_eq!(config.driver.retries, 3);
        assert_eq!(config.driver.receive_timeout, Duration::from_millis(200));
        assert_eq!(config.esc.staleness_timeout, Duration::from_secs(10));
        assert_eq!(config.datalog.chunk_size, 4096);
        assert_eq!(config.esc.mirrored.len(), 5);
    }

    #[test]
    fn durations_parse_in_their_units() {
        let config: AppConfig = r#"
            [polling]
            fast_interval = 250

            [esc]
            staleness_timeout = 3

            [driver]
            receive_timeout = 50
            retry_delay = 10
        "#
        .parse()
        .unwrap();
        assert_eq!(config.polling.fast_interval, Duration::from_millis(250));
        assert_eq!(config.esc.staleness_timeout, Duration::from_secs(3));
        assert_eq!(config.driver.receive_timeout, Duration::from_millis(50));
        assert_eq!(config.driver.retry_delay, Duration::from_millis(10));
    }

    #[test]
    fn overlapping_parameter_sets_are_rejected() {
        let err = r#"
            [polling]
            fast = ["battery_voltage"]
            slow = ["battery_voltage"]
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("battery_voltage"));
    }

    #[test]
    fn logging_components_parse_and_bad_levels_are_rejected() {
        let config: AppConfig = r#"
            [logging]
            level = "warn"
            rotation = "off"
            format = "compact"

            [logging.components]
            bridge = "debug"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.logging.rotation, LogRotation::Off);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.logging.components.bridge.as_deref(), Some("debug"));

        let err = "[logging.components]\nwriter = \"chatty\"\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("r_bms_persistence::writer=chatty"));
    }

    #[test]
    fn small_chunks_are_rejected() {
        let err = "[datalog]\nchunk_size = 16\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }
}
