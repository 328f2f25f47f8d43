//! The four output stages.
//!
//! Each drains exactly one queue or buffer and increments its own counter only after the
//! side effect succeeded. A failing collaborator or a full disk ends that stage alone:
//! its queue is abandoned so the producer stops feeding it, and the sibling stages keep
//! running.

use tracing::{error, info, warn};

use super::{ExitReason, StageKind, StageSummary};
use crate::channel::{Channel, ResultBuffer, WindowQueue};
use crate::hardware::OutputDevice;
use crate::shared_counters::Counter;
use crate::storage::{CsvSink, DiskSpaceGuard};

fn drain<T>(
    channel: &Channel,
    stage: StageKind,
    counter: Counter,
    mut pop: impl FnMut() -> Option<T>,
    mut consume: impl FnMut(&T) -> Result<(), ExitReason>,
    abandon: impl FnOnce(),
) -> StageSummary {
    let id = channel.id();
    let mut items: u64 = 0;
    info!(channel = %id, %stage, "Output stage started");

    let reason = loop {
        let Some(item) = pop() else {
            break if channel.shutdown().is_triggered() {
                ExitReason::Stopped
            } else {
                ExitReason::EndOfStream
            };
        };
        if let Err(reason) = consume(&item) {
            abandon();
            break reason;
        }
        channel.counters().increment(counter);
        items += 1;
    };

    info!(channel = %id, %stage, items, ?reason, "Output stage finished");
    StageSummary {
        stage,
        items,
        reason,
    }
}

fn finish_file(channel: &Channel, stage: StageKind, sink: &mut CsvSink) {
    if let Err(e) = sink.flush() {
        warn!(channel = %channel.id(), %stage, path = %sink.path().display(), "Flush failed: {}", e);
    }
}

/// Append every raw window to `sink`.
pub fn run_raw_to_file(
    channel: &Channel,
    sink: &mut CsvSink,
    disk: &mut DiskSpaceGuard,
) -> StageSummary {
    let stage = StageKind::RawToFile;
    let summary = drain(
        channel,
        stage,
        Counter::RawToFile,
        || channel.pop_window(WindowQueue::RawToFile),
        |window| {
            if !disk.has_room() {
                return Err(ExitReason::DiskFull);
            }
            sink.append_record(&**window).map_err(|e| {
                error!(channel = %channel.id(), %stage, sequence = window.sequence, "Write failed: {}", e);
                ExitReason::Failed(e.to_string())
            })
        },
        || {
            channel.abandon_window_queue(WindowQueue::RawToFile);
        },
    );
    finish_file(channel, stage, sink);
    summary
}

/// Replay every raw window on `device`.
pub fn run_raw_to_device(channel: &Channel, device: &mut dyn OutputDevice) -> StageSummary {
    let stage = StageKind::RawToDevice;
    let id = channel.id();
    drain(
        channel,
        stage,
        Counter::RawToDevice,
        || channel.pop_window(WindowQueue::RawToDevice),
        |window| {
            device.write_waveform(id, &window.samples).map_err(|e| {
                error!(channel = %id, %stage, sequence = window.sequence, "Output failed: {:#}", e);
                ExitReason::Failed(format!("{:#}", e))
            })
        },
        || {
            channel.abandon_window_queue(WindowQueue::RawToDevice);
        },
    )
}

/// Append every inference result to `sink`.
pub fn run_result_to_file(
    channel: &Channel,
    sink: &mut CsvSink,
    disk: &mut DiskSpaceGuard,
) -> StageSummary {
    let stage = StageKind::ResultToFile;
    let summary = drain(
        channel,
        stage,
        Counter::ResultToFile,
        || channel.pop_result(ResultBuffer::ToFile),
        |result| {
            if !disk.has_room() {
                return Err(ExitReason::DiskFull);
            }
            sink.append_record(result).map_err(|e| {
                error!(channel = %channel.id(), %stage, sequence = result.sequence, "Write failed: {}", e);
                ExitReason::Failed(e.to_string())
            })
        },
        || {
            channel.abandon_result_buffer(ResultBuffer::ToFile);
        },
    );
    finish_file(channel, stage, sink);
    summary
}

/// Drive the output device to the first element of every inference result.
pub fn run_result_to_device(channel: &Channel, device: &mut dyn OutputDevice) -> StageSummary {
    let stage = StageKind::ResultToDevice;
    let id = channel.id();
    drain(
        channel,
        stage,
        Counter::ResultToDevice,
        || channel.pop_result(ResultBuffer::ToDevice),
        |result| {
            device.set_output_level(id, result.output_level()).map_err(|e| {
                error!(channel = %id, %stage, sequence = result.sequence, "Output failed: {:#}", e);
                ExitReason::Failed(format!("{:#}", e))
            })
        },
        || {
            channel.abandon_result_buffer(ResultBuffer::ToDevice);
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkSelection;
    use crate::hardware::MockOutput;
    use crate::shared_counters::SharedCountersBlock;
    use crate::shutdown::ShutdownToken;
    use crate::storage::{raw_file_path, result_file_path};
    use crate::types::{ChannelId, InferenceResult, SampleWindow};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(sinks: SinkSelection) -> (TempDir, Arc<Channel>, ShutdownToken) {
        let dir = tempfile::tempdir().unwrap();
        let block = Arc::new(SharedCountersBlock::create(dir.path(), "out").unwrap());
        let shutdown = ShutdownToken::new();
        let channel = Channel::new(ChannelId::Ch1, sinks, block, shutdown.clone());
        (dir, channel, shutdown)
    }

    fn result(sequence: u64, value: f32) -> InferenceResult {
        InferenceResult {
            sequence,
            output: vec![value],
            computation_time: Duration::from_micros(10),
        }
    }

    fn everything() -> SinkSelection {
        SinkSelection {
            raw_to_file: true,
            raw_to_device: true,
            result_to_file: true,
            result_to_device: true,
        }
    }

    #[test]
    fn test_raw_to_file_writes_every_window() {
        let (dir, channel, _) = setup(everything());
        for seq in 0..3 {
            channel.publish_window(Arc::new(SampleWindow::new(seq, vec![0.1, 0.2])));
        }
        channel.close_windows();

        let path = raw_file_path(dir.path(), ChannelId::Ch1);
        let mut sink = CsvSink::create(&path).unwrap();
        let mut disk = DiskSpaceGuard::new(dir.path(), 0, 1);
        let summary = run_raw_to_file(&channel, &mut sink, &mut disk);

        assert_eq!(summary.items, 3);
        assert_eq!(summary.reason, ExitReason::EndOfStream);
        assert_eq!(channel.counters().get(Counter::RawToFile), 3);
        let lines = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 4, "header plus three rows");
    }

    #[test]
    fn test_full_disk_ends_file_stage() {
        let (dir, channel, _) = setup(everything());
        channel.publish_result(result(0, 0.1));
        channel.publish_result(result(1, 0.2));
        channel.close_results();

        let mut sink = CsvSink::create(result_file_path(dir.path(), ChannelId::Ch1)).unwrap();
        let mut disk = DiskSpaceGuard::new(dir.path(), u64::MAX, 1);
        let summary = run_result_to_file(&channel, &mut sink, &mut disk);

        assert_eq!(summary.reason, ExitReason::DiskFull);
        assert_eq!(summary.items, 0);
        assert_eq!(channel.counters().get(Counter::ResultToFile), 0);
        assert_eq!(channel.pending().result_to_file, 0);
    }

    #[test]
    fn test_result_to_device_drives_clamped_first_element() {
        let (_dir, channel, _) = setup(everything());
        channel.publish_result(result(0, 0.25));
        channel.publish_result(result(1, 3.0));
        channel.close_results();

        let mut dac = MockOutput::new();
        let log = dac.log();
        let summary = run_result_to_device(&channel, &mut dac);

        assert_eq!(summary.items, 2);
        assert_eq!(channel.counters().get(Counter::ResultToDevice), 2);
        assert_eq!(*log.lock(), vec![(ChannelId::Ch1, 0.25), (ChannelId::Ch1, 1.0)]);
    }

    #[test]
    fn test_raw_to_device_failure_is_not_counted() {
        let (_dir, channel, _) = setup(everything());
        channel.publish_window(Arc::new(SampleWindow::new(0, vec![0.5])));
        channel.publish_window(Arc::new(SampleWindow::new(1, vec![0.5])));
        channel.close_windows();

        let mut dac = MockOutput::new().failing_after(1);
        let summary = run_raw_to_device(&channel, &mut dac);

        assert_eq!(summary.items, 1);
        assert!(matches!(summary.reason, ExitReason::Failed(_)));
        assert_eq!(channel.counters().get(Counter::RawToDevice), 1);
    }

    #[test]
    fn test_stop_drains_queued_results() {
        let (_dir, channel, shutdown) = setup(everything());
        channel.publish_result(result(0, 0.1));
        channel.publish_result(result(1, 0.2));
        shutdown.trigger();
        channel.close_results();

        let mut dac = MockOutput::new();
        let summary = run_result_to_device(&channel, &mut dac);

        assert_eq!(summary.items, 2);
        assert_eq!(summary.reason, ExitReason::Stopped);
    }
}
