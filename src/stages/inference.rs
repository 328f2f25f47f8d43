//! Inference stage: inference queue → engine → result buffers.

use std::time::Instant;
use tracing::{debug, error, info, trace};

use super::{ExitReason, StageKind, StageSummary};
use crate::channel::{Channel, WindowQueue};
use crate::hardware::InferenceEngine;
use crate::shared_counters::Counter;
use crate::types::InferenceResult;

/// Run `engine` on every window of the inference queue and copy each result into the
/// enabled result buffers.
///
/// When the inference queue ends, or the engine fails, both result buffers are closed so
/// the result stages drain and exit. After an engine failure the inference queue is
/// abandoned so acquisition stops feeding it.
pub fn run_inference(channel: &Channel, engine: &mut dyn InferenceEngine) -> StageSummary {
    let _close = channel.result_close_guard();
    let id = channel.id();
    let mut processed: u64 = 0;

    info!(channel = %id, "Inference started");

    let reason = loop {
        let Some(window) = channel.pop_window(WindowQueue::Inference) else {
            break if channel.shutdown().is_triggered() {
                ExitReason::Stopped
            } else {
                ExitReason::EndOfStream
            };
        };

        let started = Instant::now();
        let output = match engine.infer(&window) {
            Ok(output) => output,
            Err(e) => {
                error!(channel = %id, sequence = window.sequence, "Inference failed: {:#}", e);
                channel.abandon_window_queue(WindowQueue::Inference);
                break ExitReason::Failed(format!("{:#}", e));
            }
        };
        let measured = started.elapsed();
        let computation_time = if output.elapsed.is_zero() {
            measured
        } else {
            output.elapsed
        };
        trace!(
            channel = %id,
            sequence = window.sequence,
            micros = computation_time.as_micros() as u64,
            "Window inferred"
        );

        let fed = channel.publish_result(InferenceResult {
            sequence: window.sequence,
            output: output.values,
            computation_time,
        });
        channel.counters().increment(Counter::Processed);
        processed += 1;
        debug!(channel = %id, sequence = window.sequence, buffers = fed, "Result published");
    };

    info!(channel = %id, processed, ?reason, "Inference finished");
    StageSummary {
        stage: StageKind::Inference,
        items: processed,
        reason,
    }
}
