//! Per-channel pipeline state and the queue protocol shared by every stage.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────┐
//!                      │ Acquisition stage│
//!                      └────────┬─────────┘
//!            ┌──────────────────┼──────────────────┐
//!            ▼                  ▼                  ▼
//!      raw→file queue    raw→device queue    inference queue
//!            │                  │                  │
//!            ▼                  ▼         ┌────────▼─────────┐
//!       Raw→File stage   Raw→Device stage │  Inference stage │
//!                                         └────────┬─────────┘
//!                                     ┌────────────┴───────────┐
//!                                     ▼                        ▼
//!                            result→file buffer      result→device buffer
//!                                     │                        │
//!                                     ▼                        ▼
//!                             Result→File stage       Result→Device stage
//! ```
//!
//! All five queues live behind one mutex, each with its own condition variable. A queue
//! is either `Open` or `Closed`; closing means no further item will ever be pushed, which
//! lets a consumer tell a transiently empty queue from a finished one.
//!
//! # Shutdown policy
//!
//! Drain, then exit. A stop request halts acquisition, which closes the window queues on
//! its way out; inference then drains its queue and closes the result buffers. Consumers
//! report end-of-stream only once their queue is empty and closed by its producer, so
//! nothing queued before the stop is discarded.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace, warn};

use crate::config::SinkSelection;
use crate::shared_counters::{SharedCounters, SharedCountersBlock};
use crate::shutdown::{ShutdownListener, ShutdownToken};
use crate::types::{ChannelId, InferenceResult, SharedWindow};

/// Whether a queue can still receive items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// The producer may push more items.
    Open,
    /// The producer finished (or the sink is disabled); no item will ever be pushed again.
    Closed,
}

/// FIFO queue with an explicit open/closed state.
#[derive(Debug)]
pub struct StageQueue<T> {
    items: VecDeque<T>,
    state: QueueState,
    pushed: u64,
}

impl<T> StageQueue<T> {
    fn new(state: QueueState) -> Self {
        Self {
            items: VecDeque::new(),
            state,
            pushed: 0,
        }
    }

    fn push(&mut self, item: T) -> bool {
        if self.state == QueueState::Closed {
            return false;
        }
        self.items.push_back(item);
        self.pushed += 1;
        true
    }

    fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn close(&mut self) {
        self.state = QueueState::Closed;
    }

    /// Current state.
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Items waiting to be consumed.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no item is waiting.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the queue is closed and fully drained.
    pub fn is_finished(&self) -> bool {
        self.state == QueueState::Closed && self.items.is_empty()
    }

    /// Total items ever pushed.
    pub fn pushed(&self) -> u64 {
        self.pushed
    }
}

/// The three queues fed with raw windows by the acquisition stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowQueue {
    /// Raw windows to be appended to the data file
    RawToFile,
    /// Raw windows to be forwarded to the output device
    RawToDevice,
    /// Windows awaiting inference (always fed)
    Inference,
}

/// The two buffers fed with results by the inference stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultBuffer {
    /// Results to be appended to the result file
    ToFile,
    /// Results to be driven onto the output device
    ToDevice,
}

struct ChannelState {
    raw_to_file: StageQueue<SharedWindow>,
    raw_to_device: StageQueue<SharedWindow>,
    inference: StageQueue<SharedWindow>,
    result_to_file: StageQueue<InferenceResult>,
    result_to_device: StageQueue<InferenceResult>,
    channel_triggered: bool,
    trigger_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
}

impl ChannelState {
    fn window_queue(&mut self, which: WindowQueue) -> &mut StageQueue<SharedWindow> {
        match which {
            WindowQueue::RawToFile => &mut self.raw_to_file,
            WindowQueue::RawToDevice => &mut self.raw_to_device,
            WindowQueue::Inference => &mut self.inference,
        }
    }

    fn result_buffer(&mut self, which: ResultBuffer) -> &mut StageQueue<InferenceResult> {
        match which {
            ResultBuffer::ToFile => &mut self.result_to_file,
            ResultBuffer::ToDevice => &mut self.result_to_device,
        }
    }
}

/// Items left behind in a channel's queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    /// Windows still queued for the raw→file stage
    pub raw_to_file: usize,
    /// Windows still queued for the raw→device stage
    pub raw_to_device: usize,
    /// Windows still queued for inference
    pub inference: usize,
    /// Results still buffered for the result→file stage
    pub result_to_file: usize,
    /// Results still buffered for the result→device stage
    pub result_to_device: usize,
}

impl Pending {
    /// Sum over every queue.
    pub fn total(&self) -> usize {
        self.raw_to_file
            + self.raw_to_device
            + self.inference
            + self.result_to_file
            + self.result_to_device
    }
}

/// Per-channel pipeline context.
///
/// Exactly one acquisition thread pushes windows, exactly one inference thread pops the
/// inference queue and pushes results, and each enabled output stage has one consumer.
/// Queues of disabled sinks are created closed and never receive fan-out traffic.
pub struct Channel {
    id: ChannelId,
    sinks: SinkSelection,
    state: Mutex<ChannelState>,
    cond_raw_to_file: Condvar,
    cond_raw_to_device: Condvar,
    cond_inference: Condvar,
    cond_result_to_file: Condvar,
    cond_result_to_device: Condvar,
    counters: Arc<SharedCountersBlock>,
    shutdown: ShutdownToken,
}

fn initial_state(enabled: bool) -> QueueState {
    if enabled {
        QueueState::Open
    } else {
        QueueState::Closed
    }
}

impl Channel {
    /// Create the channel context and register it for shutdown broadcasts.
    pub fn new(
        id: ChannelId,
        sinks: SinkSelection,
        counters: Arc<SharedCountersBlock>,
        shutdown: ShutdownToken,
    ) -> Arc<Self> {
        let state = ChannelState {
            raw_to_file: StageQueue::new(initial_state(sinks.raw_to_file)),
            raw_to_device: StageQueue::new(initial_state(sinks.raw_to_device)),
            inference: StageQueue::new(QueueState::Open),
            result_to_file: StageQueue::new(initial_state(sinks.result_to_file)),
            result_to_device: StageQueue::new(initial_state(sinks.result_to_device)),
            channel_triggered: false,
            trigger_time: None,
            end_time: None,
        };

        let channel = Arc::new(Self {
            id,
            sinks,
            state: Mutex::new(state),
            cond_raw_to_file: Condvar::new(),
            cond_raw_to_device: Condvar::new(),
            cond_inference: Condvar::new(),
            cond_result_to_file: Condvar::new(),
            cond_result_to_device: Condvar::new(),
            counters,
            shutdown: shutdown.clone(),
        });

        let weak = Arc::downgrade(&channel);
        shutdown.register(weak);
        channel
    }

    /// Which channel this is.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Sinks enabled on this channel.
    pub fn sinks(&self) -> SinkSelection {
        self.sinks
    }

    /// This channel's slot in the shared counters block.
    pub fn counters(&self) -> &SharedCounters {
        self.counters.slot(self.id)
    }

    /// Run-wide cancellation handle.
    pub fn shutdown(&self) -> &ShutdownToken {
        &self.shutdown
    }

    fn window_cond(&self, which: WindowQueue) -> &Condvar {
        match which {
            WindowQueue::RawToFile => &self.cond_raw_to_file,
            WindowQueue::RawToDevice => &self.cond_raw_to_device,
            WindowQueue::Inference => &self.cond_inference,
        }
    }

    fn result_cond(&self, which: ResultBuffer) -> &Condvar {
        match which {
            ResultBuffer::ToFile => &self.cond_result_to_file,
            ResultBuffer::ToDevice => &self.cond_result_to_device,
        }
    }

    /// Fan a window out to every open window queue.
    ///
    /// The inference queue is always open while acquisition runs; the raw queues are
    /// open only when their sink is enabled. Returns the number of queues fed.
    pub fn publish_window(&self, window: SharedWindow) -> usize {
        const ALL: [WindowQueue; 3] = [
            WindowQueue::RawToFile,
            WindowQueue::RawToDevice,
            WindowQueue::Inference,
        ];

        let mut fed = [false; 3];
        {
            let mut state = self.state.lock();
            for (slot, which) in ALL.iter().enumerate() {
                fed[slot] = state.window_queue(*which).push(Arc::clone(&window));
            }
        }

        for (slot, which) in ALL.iter().enumerate() {
            if fed[slot] {
                self.window_cond(*which).notify_one();
            }
        }
        trace!(channel = %self.id, sequence = window.sequence, "Published window");
        fed.iter().filter(|f| **f).count()
    }

    /// Push a window onto one queue. Returns `false` if the queue is closed.
    pub fn push_window(&self, which: WindowQueue, window: SharedWindow) -> bool {
        let pushed = self.state.lock().window_queue(which).push(window);
        if pushed {
            self.window_cond(which).notify_one();
        }
        pushed
    }

    /// Push a result onto one buffer. Returns `false` if the buffer is closed.
    pub fn push_result(&self, which: ResultBuffer, result: InferenceResult) -> bool {
        let pushed = self.state.lock().result_buffer(which).push(result);
        if pushed {
            self.result_cond(which).notify_one();
        }
        pushed
    }

    /// Copy a result into every open result buffer. Returns the number of buffers fed.
    pub fn publish_result(&self, result: InferenceResult) -> usize {
        let mut fed = 0;
        if self.sinks.result_to_file && self.push_result(ResultBuffer::ToFile, result.clone()) {
            fed += 1;
        }
        if self.sinks.result_to_device && self.push_result(ResultBuffer::ToDevice, result) {
            fed += 1;
        }
        fed
    }

    /// Block until a window is available on `which` or the stream ended.
    ///
    /// Returns `None` once the queue is empty and closed. A stop request alone does not
    /// end the stream; the producer closes the queue when it exits. Spurious wake-ups
    /// re-check the predicate.
    pub fn pop_window(&self, which: WindowQueue) -> Option<SharedWindow> {
        let cond = self.window_cond(which);
        let mut state = self.state.lock();
        loop {
            let queue = state.window_queue(which);
            if let Some(window) = queue.pop() {
                return Some(window);
            }
            if queue.state() == QueueState::Closed {
                return None;
            }
            cond.wait(&mut state);
        }
    }

    /// Block until a result is available on `which` or the stream ended.
    ///
    /// Same end-of-stream rule as [`Channel::pop_window`].
    pub fn pop_result(&self, which: ResultBuffer) -> Option<InferenceResult> {
        let cond = self.result_cond(which);
        let mut state = self.state.lock();
        loop {
            let buffer = state.result_buffer(which);
            if let Some(result) = buffer.pop() {
                return Some(result);
            }
            if buffer.state() == QueueState::Closed {
                return None;
            }
            cond.wait(&mut state);
        }
    }

    /// Mark acquisition as finished: close the three window queues and wake their
    /// consumers.
    pub fn close_windows(&self) {
        {
            let mut state = self.state.lock();
            state.raw_to_file.close();
            state.raw_to_device.close();
            state.inference.close();
        }
        self.cond_raw_to_file.notify_all();
        self.cond_raw_to_device.notify_all();
        self.cond_inference.notify_all();
        debug!(channel = %self.id, "Acquisition done, window queues closed");
    }

    /// Mark processing as finished: close both result buffers and wake their consumers.
    pub fn close_results(&self) {
        {
            let mut state = self.state.lock();
            state.result_to_file.close();
            state.result_to_device.close();
        }
        self.cond_result_to_file.notify_all();
        self.cond_result_to_device.notify_all();
        debug!(channel = %self.id, "Processing done, result buffers closed");
    }

    /// Consumer-side close of a window queue: discard what is queued and refuse further
    /// pushes. Used when a consumer stage fails so its queue stops growing. Returns the
    /// number of discarded windows.
    pub fn abandon_window_queue(&self, which: WindowQueue) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let queue = state.window_queue(which);
            queue.close();
            let discarded = queue.items.len();
            queue.items.clear();
            discarded
        };
        self.window_cond(which).notify_all();
        if discarded > 0 {
            warn!(channel = %self.id, queue = ?which, discarded, "Abandoned window queue");
        }
        discarded
    }

    /// Consumer-side close of a result buffer. See [`Channel::abandon_window_queue`].
    pub fn abandon_result_buffer(&self, which: ResultBuffer) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let buffer = state.result_buffer(which);
            buffer.close();
            let discarded = buffer.items.len();
            buffer.items.clear();
            discarded
        };
        self.result_cond(which).notify_all();
        if discarded > 0 {
            warn!(channel = %self.id, buffer = ?which, discarded, "Abandoned result buffer");
        }
        discarded
    }

    /// Whether the acquisition stage finished (`acquisition_done`).
    pub fn is_acquisition_done(&self) -> bool {
        self.state.lock().inference.state() == QueueState::Closed
    }

    /// Whether the inference stage finished (`processing_done`).
    pub fn is_processing_done(&self) -> bool {
        let state = self.state.lock();
        state.result_to_file.state() == QueueState::Closed
            && state.result_to_device.state() == QueueState::Closed
    }

    /// Record the first hardware trigger. Returns `true` only for the first call.
    pub fn mark_triggered(&self, at: SystemTime, at_nanos: u64) -> bool {
        let first = {
            let mut state = self.state.lock();
            if state.channel_triggered {
                false
            } else {
                state.channel_triggered = true;
                state.trigger_time = Some(at);
                true
            }
        };
        if first {
            self.counters().record_trigger(at_nanos);
        }
        first
    }

    /// Record the end of acquisition.
    pub fn mark_end(&self, at: SystemTime, at_nanos: u64) {
        self.state.lock().end_time = Some(at);
        self.counters().record_end(at_nanos);
    }

    /// Whether the hardware trigger was seen (`channel_triggered`).
    pub fn is_triggered(&self) -> bool {
        self.state.lock().channel_triggered
    }

    /// Trigger and end timestamps, if recorded.
    pub fn timing(&self) -> (Option<SystemTime>, Option<SystemTime>) {
        let state = self.state.lock();
        (state.trigger_time, state.end_time)
    }

    /// Number of items pushed so far onto a window queue.
    pub fn windows_pushed(&self, which: WindowQueue) -> u64 {
        self.state.lock().window_queue(which).pushed()
    }

    /// Number of items pushed so far onto a result buffer.
    pub fn results_pushed(&self, which: ResultBuffer) -> u64 {
        self.state.lock().result_buffer(which).pushed()
    }

    /// State of a window queue.
    pub fn window_queue_state(&self, which: WindowQueue) -> QueueState {
        self.state.lock().window_queue(which).state()
    }

    /// State of a result buffer.
    pub fn result_buffer_state(&self, which: ResultBuffer) -> QueueState {
        self.state.lock().result_buffer(which).state()
    }

    /// Items still queued anywhere in the channel.
    pub fn pending(&self) -> Pending {
        let state = self.state.lock();
        Pending {
            raw_to_file: state.raw_to_file.len(),
            raw_to_device: state.raw_to_device.len(),
            inference: state.inference.len(),
            result_to_file: state.result_to_file.len(),
            result_to_device: state.result_to_device.len(),
        }
    }

    /// Guard that closes the window queues when dropped, so consumers are released even
    /// if the producing stage unwinds.
    pub fn window_close_guard(&self) -> CloseGuard<'_> {
        CloseGuard {
            channel: self,
            target: CloseTarget::Windows,
        }
    }

    /// Guard that closes the result buffers when dropped.
    pub fn result_close_guard(&self) -> CloseGuard<'_> {
        CloseGuard {
            channel: self,
            target: CloseTarget::Results,
        }
    }

    /// Log anything left queued when the channel is torn down.
    pub fn report_leftovers(&self) -> Pending {
        let pending = self.pending();
        if pending.total() > 0 {
            warn!(channel = %self.id, ?pending, "Items left unconsumed at teardown");
        }
        pending
    }
}

impl ShutdownListener for Channel {
    fn wake_all(&self) {
        // Holding the mutex orders this wake after any waiter's predicate check.
        let _state = self.state.lock();
        self.cond_raw_to_file.notify_all();
        self.cond_raw_to_device.notify_all();
        self.cond_inference.notify_all();
        self.cond_result_to_file.notify_all();
        self.cond_result_to_device.notify_all();
    }
}

enum CloseTarget {
    Windows,
    Results,
}

/// Closes a group of queues on drop. See [`Channel::window_close_guard`].
pub struct CloseGuard<'a> {
    channel: &'a Channel,
    target: CloseTarget,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        match self.target {
            CloseTarget::Windows => self.channel.close_windows(),
            CloseTarget::Results => self.channel.close_results(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleWindow;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn channel(sinks: SinkSelection) -> (TempDir, Arc<Channel>, ShutdownToken) {
        let dir = tempfile::tempdir().unwrap();
        let block = Arc::new(SharedCountersBlock::create(dir.path(), "counters").unwrap());
        let shutdown = ShutdownToken::new();
        let channel = Channel::new(ChannelId::Ch1, sinks, block, shutdown.clone());
        (dir, channel, shutdown)
    }

    fn window(sequence: u64) -> SharedWindow {
        Arc::new(SampleWindow::new(sequence, vec![sequence as f32]))
    }

    fn result(sequence: u64) -> InferenceResult {
        InferenceResult {
            sequence,
            output: vec![sequence as f32],
            computation_time: Duration::from_micros(1),
        }
    }

    fn all_sinks() -> SinkSelection {
        SinkSelection {
            raw_to_file: true,
            raw_to_device: true,
            result_to_file: true,
            result_to_device: false,
        }
    }

    #[test]
    fn test_fifo_order() {
        let (_dir, ch, _) = channel(all_sinks());
        for seq in 0..5 {
            ch.publish_window(window(seq));
        }
        ch.close_windows();

        let popped: Vec<u64> = std::iter::from_fn(|| ch.pop_window(WindowQueue::Inference))
            .map(|w| w.sequence)
            .collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fan_out_skips_disabled_sinks() {
        let sinks = SinkSelection {
            raw_to_file: true,
            ..Default::default()
        };
        let (_dir, ch, _) = channel(sinks);

        assert_eq!(ch.publish_window(window(0)), 2);
        assert_eq!(ch.windows_pushed(WindowQueue::RawToFile), 1);
        assert_eq!(ch.windows_pushed(WindowQueue::Inference), 1);
        assert_eq!(ch.windows_pushed(WindowQueue::RawToDevice), 0);
        assert_eq!(
            ch.window_queue_state(WindowQueue::RawToDevice),
            QueueState::Closed
        );
    }

    #[test]
    fn test_fan_out_shares_one_window() {
        let (_dir, ch, _) = channel(all_sinks());
        let w = window(3);
        ch.publish_window(Arc::clone(&w));
        let a = ch.pop_window(WindowQueue::RawToFile).unwrap();
        let b = ch.pop_window(WindowQueue::Inference).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &w));
    }

    #[test]
    fn test_closed_and_empty_is_end_of_stream() {
        let (_dir, ch, _) = channel(all_sinks());
        ch.publish_window(window(0));
        ch.close_windows();

        assert!(ch.is_acquisition_done());
        assert!(ch.pop_window(WindowQueue::RawToFile).is_some());
        assert!(ch.pop_window(WindowQueue::RawToFile).is_none());
        assert!(!ch.push_window(WindowQueue::RawToFile, window(1)));
    }

    #[test]
    fn test_stop_drains_before_end_of_stream() {
        let (_dir, ch, shutdown) = channel(all_sinks());
        ch.publish_window(window(0));
        ch.publish_window(window(1));
        shutdown.trigger();

        assert_eq!(ch.pop_window(WindowQueue::Inference).unwrap().sequence, 0);
        assert_eq!(ch.pop_window(WindowQueue::Inference).unwrap().sequence, 1);
        ch.close_windows();
        assert!(ch.pop_window(WindowQueue::Inference).is_none());
    }

    #[test]
    fn test_stop_keeps_result_consumer_until_buffer_closes() {
        let (_dir, ch, shutdown) = channel(all_sinks());
        let consumer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                std::iter::from_fn(|| ch.pop_result(ResultBuffer::ToFile))
                    .map(|r| r.sequence)
                    .collect::<Vec<u64>>()
            })
        };

        shutdown.trigger();
        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        // Inference still finishing windows queued before the stop.
        ch.publish_result(result(7));
        ch.publish_result(result(8));
        ch.close_results();
        assert_eq!(consumer.join().unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_blocked_consumer_wakes_on_close() {
        let (_dir, ch, _) = channel(all_sinks());
        let consumer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.pop_result(ResultBuffer::ToFile))
        };

        thread::sleep(Duration::from_millis(50));
        ch.close_results();
        assert!(consumer.join().unwrap().is_none());
        assert!(ch.is_processing_done());
    }

    #[test]
    fn test_publish_result_copies_into_enabled_buffers() {
        let sinks = SinkSelection {
            result_to_file: true,
            result_to_device: true,
            ..Default::default()
        };
        let (_dir, ch, _) = channel(sinks);

        assert_eq!(ch.publish_result(result(9)), 2);
        assert_eq!(ch.pop_result(ResultBuffer::ToFile).unwrap().sequence, 9);
        assert_eq!(ch.pop_result(ResultBuffer::ToDevice).unwrap().sequence, 9);
    }

    #[test]
    fn test_close_guard_closes_on_drop() {
        let (_dir, ch, _) = channel(all_sinks());
        {
            let _guard = ch.window_close_guard();
            ch.publish_window(window(0));
        }
        assert!(ch.is_acquisition_done());
        assert_eq!(ch.pending().inference, 1);
        assert_eq!(ch.report_leftovers().total(), 3);
    }

    #[test]
    fn test_abandoned_queue_refuses_fan_out() {
        let (_dir, ch, _) = channel(all_sinks());
        ch.publish_window(window(0));
        assert_eq!(ch.abandon_window_queue(WindowQueue::RawToDevice), 1);

        assert_eq!(ch.publish_window(window(1)), 2);
        assert_eq!(ch.pending().raw_to_device, 0);
        assert_eq!(ch.pending().inference, 2);
        assert!(ch.pop_window(WindowQueue::RawToDevice).is_none());
    }

    #[test]
    fn test_trigger_recorded_once() {
        let (_dir, ch, _) = channel(all_sinks());
        let now = SystemTime::now();
        assert!(ch.mark_triggered(now, 100));
        assert!(!ch.mark_triggered(now, 200));
        assert!(ch.is_triggered());
        assert_eq!(ch.counters().trigger_time_ns(), 100);

        ch.mark_end(now, 300);
        assert_eq!(ch.counters().end_time_ns(), 300);
        assert_eq!(ch.timing(), (Some(now), Some(now)));
    }

    #[test]
    fn test_sequence_tagged_delivery_has_no_loss_or_duplicates() {
        const ITEMS: u64 = 5_000;
        const CONSUMERS: usize = 3;
        let (_dir, ch, _) = channel(all_sinks());

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ch = Arc::clone(&ch);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(w) = ch.pop_window(WindowQueue::Inference) {
                        seen.push(w.sequence);
                    }
                    seen
                })
            })
            .collect();

        let producer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                let _guard = ch.window_close_guard();
                for seq in 0..ITEMS {
                    ch.publish_window(window(seq));
                }
            })
        };
        producer.join().unwrap();

        let mut all = HashSet::new();
        let mut total = 0;
        for consumer in consumers {
            let seen = consumer.join().unwrap();
            assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "per-consumer order");
            total += seen.len();
            all.extend(seen);
        }
        assert_eq!(total as u64, ITEMS, "no item delivered twice");
        assert_eq!(all.len() as u64, ITEMS, "no item lost");
    }

    #[test]
    fn test_single_consumer_sees_producer_order() {
        let (_dir, ch, _) = channel(all_sinks());
        let consumer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(w) = ch.pop_window(WindowQueue::RawToDevice) {
                    seen.push(w.sequence);
                }
                seen
            })
        };
        for seq in 0..1_000 {
            ch.publish_window(window(seq));
        }
        ch.close_windows();
        assert_eq!(consumer.join().unwrap(), (0..1_000).collect::<Vec<_>>());
    }
}
