//! # infer-daq Core Library
//!
//! Real-time, two-channel acquisition-and-inference pipeline. Each channel reads fixed-size
//! windows from an analog input, fans them out to optional raw sinks and to an inference
//! engine, and forwards every result to optional result sinks. Stages run on dedicated
//! threads connected by mutex/condition-variable queues; both channels publish their
//! progress into a shared, memory-mapped counters block and start sampling together.
//!
//! ## Crate Structure
//!
//! - **`channel`**: Per-channel queues, the blocking pop protocol and end-of-stream
//!   signalling.
//! - **`config`**: `PipelineConfig` loaded from TOML plus `INFER_DAQ_*` environment
//!   variables, validation and sink conflict resolution.
//! - **`error`**: The `PipelineError` enum used across the library.
//! - **`hardware`**: Capability traits for the acquisition device, the output device and the
//!   inference engine, plus mock implementations.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`orchestrator`**: Channel lifecycle, thread topology and the run report.
//! - **`realtime`**: CPU pinning and `SCHED_FIFO` priority.
//! - **`shared_counters`**: The memory-mapped statistics block and startup barrier.
//! - **`shutdown`**: Cooperative cancellation shared by every thread.
//! - **`stages`**: The acquisition, inference and output stage loops.
//! - **`stats`**: Counter snapshots and the end-of-run report.
//! - **`storage`**: CSV sinks, output folders and the disk-space guard.
//! - **`types`**: Windows, results and sample scaling.

pub mod channel;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod orchestrator;
pub mod realtime;
pub mod shared_counters;
pub mod shutdown;
pub mod stages;
pub mod stats;
pub mod storage;
pub mod types;

pub use config::{PipelineConfig, SinkSelection};
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{ChannelDevices, Pipeline, PipelineState};
pub use shutdown::ShutdownToken;
pub use stats::{ChannelOutcome, ChannelReport, ChannelStats, RunReport};
pub use types::{ChannelId, InferenceResult, SampleWindow};
