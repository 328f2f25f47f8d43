//! Pipeline configuration using Figment
//!
//! Configuration is resolved once before the pipeline starts and is immutable for the
//! rest of the run. Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (missing file = defaults only)
//! 3. Environment variables prefixed with `INFER_DAQ_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use infer_daq::config::PipelineConfig;
//!
//! let config = PipelineConfig::load_from("config/infer-daq.toml")?;
//! let (sinks, warnings) = config.sinks.resolve();
//! println!("raw to file: {} ({} warnings)", sinks.raw_to_file, warnings.len());
//! # Ok::<(), infer_daq::error::PipelineError>(())
//! ```

use crate::error::{PipelineError, PipelineResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "INFER_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Requested output sinks (before conflict resolution)
    pub sinks: SinkSelection,
    /// Acquisition parameters handed to the device
    pub acquisition: AcquisitionConfig,
    /// File persistence settings
    pub storage: StorageConfig,
    /// CPU pinning and scheduling priority
    pub realtime: RealtimeConfig,
    /// Statistics segment location
    pub shared_memory: SharedMemoryConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored output for interactive use
    #[default]
    Pretty,
    /// Single-line output without colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "infer-daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// The four independently enabled output sinks.
///
/// The same switches apply to both channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSelection {
    /// Persist raw windows to the per-channel data file
    pub raw_to_file: bool,
    /// Forward raw windows to the output device
    pub raw_to_device: bool,
    /// Persist inference results to the per-channel result file
    pub result_to_file: bool,
    /// Drive inference results onto the output device
    pub result_to_device: bool,
}

/// A configuration conflict that was resolved by precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Raw and result output both requested the output device; the raw sink keeps it.
    OutputDeviceContention,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::OutputDeviceContention => write!(
                f,
                "output device is already used for raw data; inference results will NOT be sent to it"
            ),
        }
    }
}

impl SinkSelection {
    /// Apply the output device precedence rule.
    ///
    /// Raw-to-device is bound first and wins; result-to-device is disabled and a warning
    /// is returned (and logged). The result never enables both.
    pub fn resolve(self) -> (SinkSelection, Vec<ConfigWarning>) {
        let mut resolved = self;
        let mut warnings = Vec::new();

        if resolved.raw_to_device && resolved.result_to_device {
            resolved.result_to_device = false;
            let warning = ConfigWarning::OutputDeviceContention;
            warn!("{}", warning);
            warnings.push(warning);
        }

        (resolved, warnings)
    }

    /// Whether no sink at all is enabled.
    pub fn is_empty(&self) -> bool {
        !(self.raw_to_file || self.raw_to_device || self.result_to_file || self.result_to_device)
    }
}

/// Acquisition parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Samples per window (the model input length)
    pub window_size: usize,
    /// Decimation factor applied by the converter
    pub decimation: u32,
    /// Trigger level in volts
    pub trigger_level: f32,
    /// Stop after this many windows per channel (0 = until interrupted)
    pub window_limit: u64,
    /// Pause between windows of the simulated device in milliseconds
    pub window_interval_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            decimation: 125_000 / 64,
            trigger_level: 0.0,
            window_limit: 0,
            window_interval_ms: 1,
        }
    }
}

/// File persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for raw window files
    pub data_dir: PathBuf,
    /// Directory for inference result files
    pub model_dir: PathBuf,
    /// File writers stop when free space falls below this many bytes
    pub disk_space_threshold_bytes: u64,
    /// Records written between free-space checks
    pub disk_check_interval: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("DataOutput"),
            model_dir: PathBuf::from("ModelOutput"),
            disk_space_threshold_bytes: 200 * 1024 * 1024,
            disk_check_interval: 1000,
        }
    }
}

/// CPU pinning and scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Core each channel is pinned to, in channel order
    pub channel_cores: [usize; 2],
    /// Pin each channel's threads to its core
    pub pin_channels: bool,
    /// SCHED_FIFO priority requested for the inference thread (1-99)
    pub inference_priority: i32,
    /// Request real-time priority for the inference thread
    pub elevate_inference: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_cores: [0, 1],
            pin_channels: true,
            inference_priority: 20,
            elevate_inference: true,
        }
    }
}

/// Statistics segment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    /// Segment name
    pub name: String,
    /// Directory holding the segment (default: /dev/shm, else the temp dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            name: "channel_counters".to_string(),
            dir: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file and `INFER_DAQ_` environment variables
    ///
    /// Example override: `INFER_DAQ_SINKS__RAW_TO_FILE=true`
    pub fn load_from<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let config: PipelineConfig = Figment::from(Serialized::defaults(PipelineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> PipelineResult<Self> {
        let config: PipelineConfig = Figment::from(Serialized::defaults(PipelineConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> PipelineResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Configuration(format!("cannot render config: {}", e)))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> PipelineResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PipelineError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.acquisition.window_size == 0 {
            return Err(PipelineError::Configuration(
                "window_size must be greater than 0".to_string(),
            ));
        }

        if self.acquisition.decimation == 0 {
            return Err(PipelineError::Configuration(
                "decimation must be greater than 0".to_string(),
            ));
        }

        let [core_a, core_b] = self.realtime.channel_cores;
        if self.realtime.pin_channels && core_a == core_b {
            return Err(PipelineError::Configuration(format!(
                "channels must be pinned to distinct cores, both use core {}",
                core_a
            )));
        }

        if !(1..=99).contains(&self.realtime.inference_priority) {
            return Err(PipelineError::Configuration(format!(
                "Invalid inference_priority {}. Must be 1-99",
                self.realtime.inference_priority
            )));
        }

        if self.shared_memory.name.trim_start_matches('/').is_empty() {
            return Err(PipelineError::Configuration(
                "shared_memory.name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory the statistics segment is created in.
    pub fn shared_memory_dir(&self) -> PathBuf {
        self.shared_memory
            .dir
            .clone()
            .unwrap_or_else(crate::shared_counters::SharedCountersBlock::default_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tracing_test::traced_test;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.sinks.is_empty());
        assert_eq!(config.acquisition.window_size, 64);
    }

    #[test]
    #[traced_test]
    fn test_conflicting_device_sinks_resolve_to_raw() {
        let requested = SinkSelection {
            raw_to_file: false,
            raw_to_device: true,
            result_to_file: true,
            result_to_device: true,
        };

        let (resolved, warnings) = requested.resolve();

        assert!(resolved.raw_to_device);
        assert!(!resolved.result_to_device);
        assert!(resolved.result_to_file);
        assert_eq!(warnings, vec![ConfigWarning::OutputDeviceContention]);
        assert!(logs_contain("inference results will NOT be sent"));
    }

    #[test]
    fn test_non_conflicting_sinks_are_untouched() {
        let requested = SinkSelection {
            result_to_device: true,
            raw_to_file: true,
            ..Default::default()
        };
        let (resolved, warnings) = requested.resolve();
        assert_eq!(resolved, requested);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [sinks]
            raw_to_file = true

            [acquisition]
            window_size = 128

            [realtime]
            channel_cores = [2, 3]
            "#,
        )
        .unwrap();

        assert!(config.sinks.raw_to_file);
        assert!(!config.sinks.result_to_file);
        assert_eq!(config.acquisition.window_size, 128);
        assert_eq!(config.realtime.channel_cores, [2, 3]);
        assert_eq!(config.storage.data_dir, PathBuf::from("DataOutput"));
    }

    #[test]
    fn test_same_core_is_rejected() {
        let mut config = PipelineConfig::default();
        config.realtime.channel_cores = [1, 1];
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));

        config.realtime.pin_channels = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = PipelineConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_priority() {
        let mut config = PipelineConfig::default();
        config.realtime.inference_priority = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_of_effective_config() {
        let mut config = PipelineConfig::default();
        config.sinks.result_to_file = true;
        let text = config.to_toml_string().unwrap();
        assert_eq!(PipelineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_env_override() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("infer-daq.toml");
        std::fs::write(
            &path,
            "[sinks]\nraw_to_file = true\n[application]\nlog_level = \"debug\"\n",
        )
        .unwrap();

        std::env::set_var("INFER_DAQ_SINKS__RESULT_TO_DEVICE", "true");
        let loaded = PipelineConfig::load_from(&path);
        std::env::remove_var("INFER_DAQ_SINKS__RESULT_TO_DEVICE");

        let config = loaded.unwrap();
        assert!(config.sinks.raw_to_file);
        assert!(config.sinks.result_to_device);
        assert_eq!(config.application.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load_from(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }
}
