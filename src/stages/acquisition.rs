//! Acquisition stage: device → window queues.

use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use super::{epoch_nanos, ExitReason, StageKind, StageSummary};
use crate::channel::Channel;
use crate::hardware::{AcquisitionDevice, TriggerState};
use crate::shared_counters::Counter;
use crate::types::SampleWindow;

/// Read windows from `device` and fan each one out to the channel's open window queues.
///
/// Runs until the device reports no more data, a read fails, or shutdown is requested.
/// On every exit path the end time is recorded and the three window queues are closed,
/// so downstream stages drain and terminate instead of blocking.
pub fn run_acquisition(channel: &Channel, device: &mut dyn AcquisitionDevice) -> StageSummary {
    let _close = channel.window_close_guard();
    let id = channel.id();
    let mut sequence: u64 = 0;

    info!(channel = %id, "Acquisition started");

    let reason = loop {
        if channel.shutdown().is_triggered() {
            break ExitReason::Stopped;
        }

        let raw = match device.read_window(id) {
            Ok(Some(raw)) => raw,
            Ok(None) => break ExitReason::EndOfStream,
            Err(e) => {
                error!(channel = %id, sequence, "Acquisition read failed: {:#}", e);
                break ExitReason::Failed(format!("{:#}", e));
            }
        };

        let window = SampleWindow::from_raw(sequence, &raw);
        if !channel.is_triggered() {
            match device.trigger_status(id) {
                Ok(TriggerState::Triggered) => {
                    let at = window.captured_at;
                    if channel.mark_triggered(at, epoch_nanos(at)) {
                        info!(channel = %id, sequence, "Trigger detected");
                    }
                }
                Ok(TriggerState::Idle) => {}
                Err(e) => warn!(channel = %id, "Trigger status unavailable: {:#}", e),
            }
        }

        let fed = channel.publish_window(Arc::new(window));
        channel.counters().increment(Counter::Acquired);
        debug!(channel = %id, sequence, queues = fed, "Window acquired");
        sequence += 1;
    };

    let end = SystemTime::now();
    channel.mark_end(end, epoch_nanos(end));
    if let Err(e) = device.release(id) {
        warn!(channel = %id, "Failed to release acquisition device: {:#}", e);
    }
    info!(channel = %id, windows = sequence, ?reason, "Acquisition finished");

    StageSummary {
        stage: StageKind::Acquisition,
        items: sequence,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{QueueState, WindowQueue};
    use crate::config::SinkSelection;
    use crate::hardware::{AcquisitionSettings, MockAcquisition};
    use crate::shared_counters::SharedCountersBlock;
    use crate::shutdown::ShutdownToken;
    use crate::types::ChannelId;
    use tempfile::TempDir;

    fn setup(sinks: SinkSelection) -> (TempDir, Arc<Channel>, ShutdownToken) {
        let dir = tempfile::tempdir().unwrap();
        let block = Arc::new(SharedCountersBlock::create(dir.path(), "acq").unwrap());
        let shutdown = ShutdownToken::new();
        let channel = Channel::new(ChannelId::Ch1, sinks, block, shutdown.clone());
        (dir, channel, shutdown)
    }

    fn configured(mut device: MockAcquisition) -> MockAcquisition {
        device
            .configure(ChannelId::Ch1, &AcquisitionSettings::default())
            .unwrap();
        device
    }

    #[test]
    fn test_windows_fan_out_and_stream_closes() {
        let sinks = SinkSelection {
            raw_to_file: true,
            ..Default::default()
        };
        let (_dir, channel, _) = setup(sinks);
        let mut device = configured(MockAcquisition::scripted(vec![
            vec![8192, 0],
            vec![0, -8192],
            vec![4096, 4096],
        ]));

        let summary = run_acquisition(&channel, &mut device);

        assert_eq!(summary.items, 3);
        assert_eq!(summary.reason, ExitReason::EndOfStream);
        assert_eq!(channel.counters().get(Counter::Acquired), 3);
        assert_eq!(channel.windows_pushed(WindowQueue::RawToFile), 3);
        assert_eq!(channel.windows_pushed(WindowQueue::Inference), 3);
        assert_eq!(channel.windows_pushed(WindowQueue::RawToDevice), 0);
        assert!(channel.is_acquisition_done());

        let first = channel.pop_window(WindowQueue::Inference).unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.samples, vec![1.0, 0.0]);
    }

    #[test]
    fn test_trigger_and_end_are_recorded() {
        let (_dir, channel, _) = setup(SinkSelection::default());
        let mut device = configured(MockAcquisition::synthetic(3).with_window_limit(2));

        run_acquisition(&channel, &mut device);

        assert!(channel.is_triggered());
        let trigger = channel.counters().trigger_time_ns();
        let end = channel.counters().end_time_ns();
        assert!(trigger > 0);
        assert!(end >= trigger);
    }

    #[test]
    fn test_stop_before_first_read() {
        let (_dir, channel, shutdown) = setup(SinkSelection::default());
        let mut device = configured(MockAcquisition::synthetic(1));
        shutdown.trigger();

        let summary = run_acquisition(&channel, &mut device);

        assert_eq!(summary.items, 0);
        assert_eq!(summary.reason, ExitReason::Stopped);
        assert_eq!(
            channel.window_queue_state(WindowQueue::Inference),
            QueueState::Closed
        );
        assert!(!channel.is_triggered());
    }

    #[test]
    fn test_read_failure_ends_stream() {
        let (_dir, channel, _) = setup(SinkSelection::default());
        let mut device = configured(MockAcquisition::synthetic(1).failing_after(2));

        let summary = run_acquisition(&channel, &mut device);

        assert_eq!(summary.items, 2);
        assert!(matches!(summary.reason, ExitReason::Failed(_)));
        assert!(channel.is_acquisition_done());
        assert_eq!(channel.counters().get(Counter::Acquired), 2);
    }
}
