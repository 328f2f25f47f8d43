//! Collaborator contracts consumed by the pipeline.
//!
//! The pipeline never talks to hardware or to the model directly. It drives three small
//! capability traits:
//!
//! - [`AcquisitionDevice`]: configures a channel and hands out one raw window per call
//! - [`OutputDevice`]: drives an analog output level
//! - [`InferenceEngine`]: turns one window into one output vector
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is blocking: every implementation is owned by exactly one stage thread, which is
//!   allowed to suspend inside the call for a hardware- or model-defined time
//! - Is `Send` but not required to be `Sync`: there are never concurrent calls for the
//!   same channel
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! fn first_window<D: AcquisitionDevice>(device: &mut D) -> Result<Option<Vec<i16>>> {
//!     device.configure(ChannelId::Ch1, &AcquisitionSettings::default())?;
//!     device.read_window(ChannelId::Ch1)
//! }
//! ```

use anyhow::Result;
use std::time::Duration;

use crate::config::AcquisitionConfig;
use crate::types::{clamp_voltage, ChannelId, SampleWindow};

/// Parameters handed to [`AcquisitionDevice::configure`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Samples per window
    pub window_size: usize,
    /// Decimation factor of the converter
    pub decimation: u32,
    /// Trigger level in volts
    pub trigger_level: f32,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for AcquisitionSettings {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            window_size: config.window_size,
            decimation: config.decimation,
            trigger_level: config.trigger_level,
        }
    }
}

/// Hardware trigger state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Waiting for the trigger condition
    Idle,
    /// The trigger condition was met
    Triggered,
}

/// Capability: Windowed Analog Acquisition
///
/// # Contract
/// - `configure` is called once per channel before any read; an error is fatal for
///   that channel
/// - `read_window` blocks for at most one hardware window period and returns
///   `Ok(None)` when no further window will ever be available
/// - An `Err` from `read_window` is treated by the caller as the end of the stream
pub trait AcquisitionDevice: Send {
    /// Apply sampling and trigger parameters to `channel`.
    fn configure(&mut self, channel: ChannelId, settings: &AcquisitionSettings) -> Result<()>;

    /// Read the next window of raw converter counts.
    fn read_window(&mut self, channel: ChannelId) -> Result<Option<Vec<i16>>>;

    /// Current trigger state of `channel`.
    fn trigger_status(&mut self, channel: ChannelId) -> Result<TriggerState>;

    /// Stop acquisition and release the channel.
    ///
    /// # Default Implementation
    /// Nothing to release.
    fn release(&mut self, _channel: ChannelId) -> Result<()> {
        Ok(())
    }
}

/// Capability: Analog Output
///
/// # Contract
/// - Levels are volts in [-1.0, 1.0]; callers clamp before calling
/// - One output device handle per channel; raw forwarding and result output never
///   share it
pub trait OutputDevice: Send {
    /// Prepare `channel` for DC output.
    ///
    /// # Default Implementation
    /// Nothing to prepare.
    fn configure(&mut self, _channel: ChannelId) -> Result<()> {
        Ok(())
    }

    /// Drive `channel` to `volts`.
    fn set_output_level(&mut self, channel: ChannelId, volts: f32) -> Result<()>;

    /// Replay a window of samples on `channel`.
    ///
    /// # Default Implementation
    /// Steps the DC level through each sample, clamped to the output range.
    fn write_waveform(&mut self, channel: ChannelId, samples: &[f32]) -> Result<()> {
        for &sample in samples {
            self.set_output_level(channel, clamp_voltage(sample))?;
        }
        Ok(())
    }
}

/// What an [`InferenceEngine`] returns for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    /// Model output vector
    pub values: Vec<f32>,
    /// Time spent computing it
    pub elapsed: Duration,
}

/// Capability: Model Inference
///
/// # Contract
/// - Deterministic and side-effect free from the pipeline's point of view
/// - Called synchronously from the high-priority inference thread
pub trait InferenceEngine: Send {
    /// Run the model on one window.
    fn infer(&mut self, window: &SampleWindow) -> Result<InferenceOutput>;
}
