//! Custom error types for the pipeline.
//!
//! `PipelineError` is the single error type of the library. Using `thiserror`, it gathers
//! the failures that can stop a run before the stage threads start:
//!
//! - **`Config`**: wraps errors from `figment` while parsing the configuration file or the
//!   environment overrides.
//! - **`Configuration`**: semantic errors in a configuration that parsed fine (duplicate
//!   CPU cores, an unknown log level, a zero window size).
//! - **`SharedMemory`**: the statistics segment could not be created, sized or mapped.
//! - **`DeviceInit`**: an acquisition or output device refused its configuration. This is
//!   fatal for the affected channel only.
//! - **`Io`** / **`Csv`**: persistence failures while creating output files.
//!
//! Failures that happen once the stages are running are not represented here. Each stage
//! logs them and converts them into an end-of-stream condition, so a failing sink never
//! takes its siblings down.

use crate::types::ChannelId;
use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors that can prevent a run or a channel from starting.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration file or environment could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is not usable
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure while preparing output folders or files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV writer failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Shared counters segment could not be set up
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// A device rejected its configuration
    #[error("Device initialization failed on {channel}: {message}")]
    DeviceInit {
        /// Channel whose device failed
        channel: ChannelId,
        /// Error reported by the device
        message: String,
    },

    /// The OS refused to start a thread
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        /// Name the thread would have had
        name: String,
        /// Error returned by the OS
        #[source]
        source: std::io::Error,
    },

    /// One channel did not run
    #[error("{channel} failed: {message}")]
    ChannelFailed {
        /// Channel that failed
        channel: ChannelId,
        /// Why it failed
        message: String,
    },

    /// Every channel failure of a run
    #[error("Run failed with errors")]
    RunFailed(Vec<PipelineError>),
}

impl From<figment::Error> for PipelineError {
    fn from(value: figment::Error) -> Self {
        PipelineError::Config(Box::new(value))
    }
}

impl PipelineError {
    /// Whether the error stopped only one channel while the other could keep running.
    pub fn is_channel_local(&self) -> bool {
        matches!(
            self,
            PipelineError::DeviceInit { .. } | PipelineError::ChannelFailed { .. }
        )
    }
}
