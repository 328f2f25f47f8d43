//! Mock Hardware Implementations
//!
//! Provides simulated collaborators so the pipeline runs without an acquisition board or
//! a trained model.
//!
//! # Available Mocks
//!
//! - `MockAcquisition` - Synthetic sine-plus-noise windows, or a scripted list of windows
//! - `MockOutput` - Records every level it is asked to drive
//! - `MockInference` - Small deterministic feature vector, or a fixed output
//!
//! Every mock can be told to fail after a number of calls to exercise the pipeline's
//! end-of-stream handling.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::hardware::capabilities::{
    AcquisitionDevice, AcquisitionSettings, InferenceEngine, InferenceOutput, OutputDevice,
    TriggerState,
};
use crate::types::{ChannelId, SampleWindow, RAW_FULL_SCALE};

// =============================================================================
// MockAcquisition - Simulated Analog Input
// =============================================================================

enum WindowSource {
    Synthetic {
        rng: StdRng,
        phase: f32,
        cycles_per_window: f32,
    },
    Scripted(VecDeque<Vec<i16>>),
}

/// Mock acquisition channel.
///
/// Reports `Triggered` once `trigger_after` windows have been read, stops after
/// `window_limit` windows, and sleeps `interval` before each window to mimic the
/// hardware cadence.
///
/// # Example
///
/// ```rust,ignore
/// let mut adc = MockAcquisition::synthetic(1).with_window_limit(3);
/// adc.configure(ChannelId::Ch1, &AcquisitionSettings::default())?;
/// assert!(adc.read_window(ChannelId::Ch1)?.is_some());
/// ```
pub struct MockAcquisition {
    source: WindowSource,
    window_size: usize,
    configured: bool,
    reads: u64,
    window_limit: Option<u64>,
    interval: Duration,
    trigger_after: u64,
    fail_configure: bool,
    fail_after: Option<u64>,
}

impl MockAcquisition {
    /// Sine-plus-noise windows, reproducible for a given `seed`.
    pub fn synthetic(seed: u64) -> Self {
        Self::with_source(WindowSource::Synthetic {
            rng: StdRng::seed_from_u64(seed),
            phase: 0.0,
            cycles_per_window: 1.0,
        })
    }

    /// Hand out exactly `windows`, in order, then report no more data.
    pub fn scripted(windows: Vec<Vec<i16>>) -> Self {
        let limit = windows.len() as u64;
        Self::with_source(WindowSource::Scripted(windows.into())).with_window_limit(limit)
    }

    fn with_source(source: WindowSource) -> Self {
        Self {
            source,
            window_size: 64,
            configured: false,
            reads: 0,
            window_limit: None,
            interval: Duration::ZERO,
            trigger_after: 1,
            fail_configure: false,
            fail_after: None,
        }
    }

    /// Stop after `limit` windows (0 = never stop).
    pub fn with_window_limit(mut self, limit: u64) -> Self {
        self.window_limit = (limit > 0).then_some(limit);
        self
    }

    /// Pause before each window.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Report the trigger once `reads` windows have been read.
    pub fn with_trigger_after(mut self, reads: u64) -> Self {
        self.trigger_after = reads;
        self
    }

    /// Make `configure` fail.
    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    /// Make every read after the first `reads` fail.
    pub fn failing_after(mut self, reads: u64) -> Self {
        self.fail_after = Some(reads);
        self
    }

    fn next_synthetic(&mut self) -> Vec<i16> {
        let size = self.window_size;
        match &mut self.source {
            WindowSource::Synthetic {
                rng,
                phase,
                cycles_per_window,
            } => {
                let step = TAU * *cycles_per_window / size as f32;
                let window = (0..size)
                    .map(|i| {
                        let clean = (*phase + step * i as f32).sin() * 0.5;
                        let noise: f32 = rng.gen_range(-0.02..0.02);
                        ((clean + noise) * RAW_FULL_SCALE) as i16
                    })
                    .collect();
                *phase = (*phase + step * size as f32) % TAU;
                window
            }
            WindowSource::Scripted(_) => Vec::new(),
        }
    }
}

impl AcquisitionDevice for MockAcquisition {
    fn configure(&mut self, channel: ChannelId, settings: &AcquisitionSettings) -> Result<()> {
        if self.fail_configure {
            return Err(anyhow!("{}: simulated configuration failure", channel));
        }
        if settings.window_size == 0 {
            return Err(anyhow!("{}: window size must be positive", channel));
        }
        self.window_size = settings.window_size;
        self.configured = true;
        Ok(())
    }

    fn read_window(&mut self, channel: ChannelId) -> Result<Option<Vec<i16>>> {
        if !self.configured {
            return Err(anyhow!("{}: read before configure", channel));
        }
        if let Some(limit) = self.window_limit {
            if self.reads >= limit {
                return Ok(None);
            }
        }
        if let Some(fail_after) = self.fail_after {
            if self.reads >= fail_after {
                return Err(anyhow!("{}: simulated read failure", channel));
            }
        }

        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }

        let window = if let WindowSource::Scripted(windows) = &mut self.source {
            windows.pop_front()
        } else {
            Some(self.next_synthetic())
        };
        if window.is_some() {
            self.reads += 1;
        }
        Ok(window)
    }

    fn trigger_status(&mut self, _channel: ChannelId) -> Result<TriggerState> {
        if self.reads >= self.trigger_after {
            Ok(TriggerState::Triggered)
        } else {
            Ok(TriggerState::Idle)
        }
    }
}

// =============================================================================
// MockOutput - Simulated Analog Output
// =============================================================================

/// Shared record of levels driven by a [`MockOutput`].
pub type OutputLog = Arc<Mutex<Vec<(ChannelId, f32)>>>;

/// Mock analog output that records every level it is driven to.
pub struct MockOutput {
    log: OutputLog,
    writes: u64,
    fail_after: Option<u64>,
}

impl Default for MockOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOutput {
    /// Create an output with an empty log.
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            writes: 0,
            fail_after: None,
        }
    }

    /// Make every level write after the first `writes` fail.
    pub fn failing_after(mut self, writes: u64) -> Self {
        self.fail_after = Some(writes);
        self
    }

    /// Handle to the level log that stays valid after the device moves to its thread.
    pub fn log(&self) -> OutputLog {
        Arc::clone(&self.log)
    }
}

impl OutputDevice for MockOutput {
    fn set_output_level(&mut self, channel: ChannelId, volts: f32) -> Result<()> {
        if let Some(limit) = self.fail_after {
            if self.writes >= limit {
                return Err(anyhow!("{}: simulated output failure", channel));
            }
        }
        if !(-1.0..=1.0).contains(&volts) {
            return Err(anyhow!("{}: level {} V out of range", channel, volts));
        }
        self.writes += 1;
        self.log.lock().push((channel, volts));
        Ok(())
    }
}

// =============================================================================
// MockInference - Simulated Model
// =============================================================================

enum Model {
    Features,
    Fixed(Vec<f32>),
}

/// Mock inference engine.
///
/// The default model emits `[mean, rms, peak]` of the window, so results are a pure
/// function of the input.
pub struct MockInference {
    model: Model,
    latency: Duration,
    calls: u64,
    fail_after: Option<u64>,
}

impl Default for MockInference {
    fn default() -> Self {
        Self::features()
    }
}

impl MockInference {
    /// `[mean, rms, peak]` of each window.
    pub fn features() -> Self {
        Self {
            model: Model::Features,
            latency: Duration::ZERO,
            calls: 0,
            fail_after: None,
        }
    }

    /// Always return `output`.
    pub fn fixed(output: Vec<f32>) -> Self {
        Self {
            model: Model::Fixed(output),
            ..Self::features()
        }
    }

    /// Spend at least `latency` in each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every call after the first `calls` fail.
    pub fn failing_after(mut self, calls: u64) -> Self {
        self.fail_after = Some(calls);
        self
    }
}

impl InferenceEngine for MockInference {
    fn infer(&mut self, window: &SampleWindow) -> Result<InferenceOutput> {
        if let Some(limit) = self.fail_after {
            if self.calls >= limit {
                return Err(anyhow!("simulated inference failure on window {}", window.sequence));
            }
        }
        self.calls += 1;

        let started = Instant::now();
        let values = match &self.model {
            Model::Fixed(output) => output.clone(),
            Model::Features => {
                let n = window.samples.len().max(1) as f32;
                let mean = window.samples.iter().sum::<f32>() / n;
                let rms = (window.samples.iter().map(|s| s * s).sum::<f32>() / n).sqrt();
                let peak = window.samples.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
                vec![mean, rms, peak]
            }
        };
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        Ok(InferenceOutput {
            values,
            elapsed: started.elapsed(),
        })
    }
}
