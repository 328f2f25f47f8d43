//! Data carried through the pipeline.
//!
//! A [`SampleWindow`] is one inference-sized block of normalised samples. It is produced
//! once by the acquisition stage and shared by reference (`Arc`) among every queue it is
//! fanned into. An [`InferenceResult`] is produced by the inference stage and moved into
//! each enabled result buffer as an independent copy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Full scale of the 14-bit converters, used to normalise raw samples to [-1.0, 1.0).
pub const RAW_FULL_SCALE: f32 = 8192.0;

/// Lowest level accepted by the output device, in volts.
pub const OUTPUT_MIN_VOLTS: f32 = -1.0;

/// Highest level accepted by the output device, in volts.
pub const OUTPUT_MAX_VOLTS: f32 = 1.0;

/// One of the two independent hardware lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelId {
    /// First input / output lane.
    Ch1,
    /// Second input / output lane.
    Ch2,
}

impl ChannelId {
    /// Both channels, in slot order.
    pub const ALL: [ChannelId; 2] = [ChannelId::Ch1, ChannelId::Ch2];

    /// Zero-based slot of this channel in the shared counters block.
    pub fn index(self) -> usize {
        match self {
            ChannelId::Ch1 => 0,
            ChannelId::Ch2 => 1,
        }
    }

    /// One-based number used in file names and log output.
    pub fn number(self) -> usize {
        self.index() + 1
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.number())
    }
}

/// A fixed-size window of normalised input samples.
///
/// Immutable once built; the acquisition stage wraps it in an `Arc` so every consumer
/// queue holds its own reference with an independent lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    /// Position of this window in the channel's acquisition order, starting at 0.
    pub sequence: u64,
    /// Wall-clock time at which the window was read from the device.
    pub captured_at: SystemTime,
    /// Normalised samples.
    pub samples: Vec<f32>,
}

impl SampleWindow {
    /// Build a window from already normalised samples.
    pub fn new(sequence: u64, samples: Vec<f32>) -> Self {
        Self {
            sequence,
            captured_at: SystemTime::now(),
            samples,
        }
    }

    /// Build a window from raw converter counts, normalising each by [`RAW_FULL_SCALE`].
    pub fn from_raw(sequence: u64, raw: &[i16]) -> Self {
        let samples = raw.iter().map(|&s| f32::from(s) / RAW_FULL_SCALE).collect();
        Self::new(sequence, samples)
    }

    /// Number of samples in the window.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window carries no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shared handle to a window, as stored in the raw and inference queues.
pub type SharedWindow = Arc<SampleWindow>;

/// Output of one inference call plus the time the engine spent computing it.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// Sequence number of the window this result was computed from.
    pub sequence: u64,
    /// Model output vector.
    pub output: Vec<f32>,
    /// Wall-clock time spent inside the inference engine.
    pub computation_time: Duration,
}

impl InferenceResult {
    /// Level to drive the output device with for this result: the first output element,
    /// clamped to the device range. An empty output maps to 0 V.
    pub fn output_level(&self) -> f32 {
        self.output
            .first()
            .map_or(0.0, |&v| clamp_voltage(output_to_voltage(v)))
    }
}

/// Conversion of a model output element to a voltage in [-1.0, 1.0].
///
/// Quantised models emit `i16` or `i8` outputs; float models already emit volts.
pub trait ToVoltage: Copy {
    /// Scale the value into the nominal output range (not clamped).
    fn to_voltage(self) -> f32;
}

impl ToVoltage for f32 {
    fn to_voltage(self) -> f32 {
        self
    }
}

impl ToVoltage for i16 {
    fn to_voltage(self) -> f32 {
        f32::from(self) / RAW_FULL_SCALE
    }
}

impl ToVoltage for i8 {
    fn to_voltage(self) -> f32 {
        f32::from(self) / 128.0
    }
}

/// Scale a model output element to the nominal output range.
pub fn output_to_voltage<T: ToVoltage>(value: T) -> f32 {
    value.to_voltage()
}

/// Clamp a voltage to the range the output device accepts. NaN maps to 0 V.
pub fn clamp_voltage(volts: f32) -> f32 {
    if volts.is_nan() {
        return 0.0;
    }
    volts.clamp(OUTPUT_MIN_VOLTS, OUTPUT_MAX_VOLTS)
}
