//! Stage loops run by each channel's threads.
//!
//! Every stage is a plain blocking function that borrows the [`Channel`] and owns its
//! collaborator for the duration of the run. A stage never returns an error: whatever
//! ends it (end-of-stream, shutdown, a collaborator failure, a full disk) is reported in
//! the returned [`StageSummary`] and logged where it happens.
//!
//! [`Channel`]: crate::channel::Channel

pub mod acquisition;
pub mod inference;
pub mod output;

pub use acquisition::run_acquisition;
pub use inference::run_inference;
pub use output::{run_raw_to_device, run_raw_to_file, run_result_to_device, run_result_to_file};

use crate::types::ChannelId;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The six stage kinds of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageKind {
    /// Reads windows from the acquisition device
    Acquisition,
    /// Runs the inference engine
    Inference,
    /// Raw windows to file
    RawToFile,
    /// Raw windows to the output device
    RawToDevice,
    /// Results to file
    ResultToFile,
    /// Results to the output device
    ResultToDevice,
}

impl StageKind {
    /// Short stage label used in thread names and log fields.
    pub fn label(self) -> &'static str {
        match self {
            StageKind::Acquisition => "acquire",
            StageKind::Inference => "infer",
            StageKind::RawToFile => "raw-file",
            StageKind::RawToDevice => "raw-dac",
            StageKind::ResultToFile => "result-file",
            StageKind::ResultToDevice => "result-dac",
        }
    }

    /// Name of the OS thread running this stage for `channel`, e.g. `ch1-infer`.
    pub fn thread_name(self, channel: ChannelId) -> String {
        format!("ch{}-{}", channel.number(), self.label())
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a stage loop returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    /// The producer closed the stream (or the device had no more data) and everything
    /// queued was consumed.
    EndOfStream,
    /// Shutdown was requested; queued items were drained first.
    Stopped,
    /// The collaborator failed; the stream was ended early.
    Failed(String),
    /// Free disk space fell below the configured threshold.
    DiskFull,
}

/// What one stage did before it returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    /// Which stage.
    pub stage: StageKind,
    /// Items produced (acquisition) or consumed (every other stage).
    pub items: u64,
    /// Why the loop ended.
    pub reason: ExitReason,
}

/// Nanoseconds since the Unix epoch for `at` (0 if `at` predates the epoch).
pub(crate) fn epoch_nanos(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_names_carry_channel_and_stage() {
        assert_eq!(StageKind::Acquisition.thread_name(ChannelId::Ch1), "ch1-acquire");
        assert_eq!(StageKind::ResultToDevice.thread_name(ChannelId::Ch2), "ch2-result-dac");
    }

    #[test]
    fn epoch_nanos_of_epoch_is_zero() {
        assert_eq!(epoch_nanos(UNIX_EPOCH), 0);
        assert_eq!(epoch_nanos(UNIX_EPOCH + Duration::from_millis(3)), 3_000_000);
    }
}
