//! Run statistics and the end-of-run report.

use crate::config::SinkSelection;
use crate::error::PipelineError;
use crate::stages::{ExitReason, StageSummary};
use crate::types::ChannelId;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Plain copy of one channel's shared counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Windows read from the acquisition device.
    pub acquired: u64,
    /// Windows run through the inference engine.
    pub processed: u64,
    /// Raw windows written to the data file.
    pub raw_to_file: u64,
    /// Raw windows forwarded to the output device.
    pub raw_to_device: u64,
    /// Results written to the result file.
    pub results_to_file: u64,
    /// Results driven onto the output device.
    pub results_to_device: u64,
    /// First hardware trigger, ns since the Unix epoch (0 = never triggered).
    pub trigger_time_ns: u64,
    /// End of acquisition, ns since the Unix epoch (0 = not finished).
    pub end_time_ns: u64,
}

impl ChannelStats {
    /// Time between the trigger and the end of acquisition. Zero when either is unknown
    /// or the clock went backwards.
    pub fn acquisition_time(&self) -> Duration {
        if self.trigger_time_ns == 0 || self.end_time_ns == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.end_time_ns.saturating_sub(self.trigger_time_ns))
    }
}

/// How a channel's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChannelOutcome {
    /// Every stage drained and joined.
    Completed,
    /// Shutdown was requested; stages drained what was queued and exited.
    Interrupted,
    /// Setup failed before any stage started.
    Failed(String),
}

/// Final report for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    /// Which channel.
    pub channel: ChannelId,
    /// How the run ended.
    pub outcome: ChannelOutcome,
    /// Counter values read after every stage joined.
    pub stats: ChannelStats,
    /// How each stage thread ended, in join order.
    pub stages: Vec<StageSummary>,
}

impl ChannelReport {
    /// Stages that ended because of a failure or a full disk.
    pub fn stopped_early(&self) -> impl Iterator<Item = &StageSummary> {
        self.stages
            .iter()
            .filter(|s| matches!(s.reason, ExitReason::Failed(_) | ExitReason::DiskFull))
    }
}

/// Final report of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Sinks that were active for the run.
    pub sinks: SinkSelection,
    /// One entry per channel, in channel order.
    pub channels: Vec<ChannelReport>,
}

impl RunReport {
    /// Report for `channel`, if it was part of the run.
    pub fn channel(&self, channel: ChannelId) -> Option<&ChannelReport> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    /// Whether any channel failed during setup.
    pub fn has_failures(&self) -> bool {
        self.channels
            .iter()
            .any(|c| matches!(c.outcome, ChannelOutcome::Failed(_)))
    }

    /// Every channel failure gathered into one error, or `None` if both channels ran.
    pub fn failure(&self) -> Option<PipelineError> {
        let causes: Vec<PipelineError> = self
            .channels
            .iter()
            .filter_map(|c| match &c.outcome {
                ChannelOutcome::Failed(message) => Some(PipelineError::ChannelFailed {
                    channel: c.channel,
                    message: message.clone(),
                }),
                _ => None,
            })
            .collect();
        (!causes.is_empty()).then(|| PipelineError::RunFailed(causes))
    }
}

/// Format a duration as `M min S sec MS ms`.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let minutes = total_ms / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;
    format!("{} min {} sec {} ms", minutes, seconds, ms)
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n====================================\n")?;

        for report in &self.channels {
            let label = format!("Channel {} acquisition time:", report.channel.number());
            writeln!(
                f,
                "{:<40}{}",
                label,
                format_duration(report.stats.acquisition_time())
            )?;
        }

        for report in &self.channels {
            let ch = report.channel;
            let stats = &report.stats;
            if let ChannelOutcome::Failed(reason) = &report.outcome {
                writeln!(f, "{:<60}{}", format!("{} failed:", ch), reason)?;
            }
            for stage in report.stopped_early() {
                let reason = match &stage.reason {
                    ExitReason::Failed(reason) => reason.as_str(),
                    _ => "disk space below threshold",
                };
                writeln!(
                    f,
                    "{:<60}{}",
                    format!("{} {} stopped early:", ch, stage.stage),
                    reason
                )?;
            }
            writeln!(f, "{:<60}{}", format!("Total data acquired {}:", ch), stats.acquired)?;
            if self.sinks.raw_to_file {
                writeln!(
                    f,
                    "{:<60}{}",
                    format!("Total lines written {} to csv:", ch),
                    stats.raw_to_file
                )?;
            }
            if self.sinks.raw_to_device {
                writeln!(
                    f,
                    "{:<60}{}",
                    format!("Total lines written {} to output device:", ch),
                    stats.raw_to_device
                )?;
            }
            writeln!(f, "{:<60}{}", format!("Total model calculated {}:", ch), stats.processed)?;
            if self.sinks.result_to_file {
                writeln!(
                    f,
                    "{:<60}{}",
                    format!("Total results logged {} to csv file:", ch),
                    stats.results_to_file
                )?;
            }
            if self.sinks.result_to_device {
                writeln!(
                    f,
                    "{:<60}{}",
                    format!("Total results written {} to output device:", ch),
                    stats.results_to_device
                )?;
            }
        }

        write!(f, "\n====================================")
    }
}
