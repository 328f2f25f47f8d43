//! Run orchestration: per-channel lifecycle and thread topology.
//!
//! # Lifecycle
//!
//! Each channel is driven by its own supervisor thread through
//!
//! ```text
//! Init ──► BarrierWait ──► Running ──► Draining ──► Done
//!   │            │
//!   └── setup ───┴── shutdown before release ──────► Done
//!       failure
//! ```
//!
//! - **Init**: pin the supervisor to its core, configure the devices, create the
//!   channel's output files.
//! - **BarrierWait**: spin on the startup barrier in the shared counters block until both
//!   channels are ready, so sampling starts at the same time on both.
//! - **Running**: spawn the stage threads (consumers first, acquisition last).
//! - **Draining**: acquisition has returned; downstream stages finish what is queued.
//! - **Done**: every stage thread joined, leftovers reported.
//!
//! Stage threads inherit the supervisor's CPU affinity. The inference thread additionally
//! switches itself to `SCHED_FIFO`.
//!
//! A channel whose setup fails still arrives at the barrier, so its peer is released and
//! runs alone.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};
use tracing::{error, info, warn};

use crate::channel::{Channel, ResultBuffer, WindowQueue};
use crate::config::{PipelineConfig, SinkSelection};
use crate::error::{PipelineError, PipelineResult};
use crate::hardware::{AcquisitionDevice, AcquisitionSettings, InferenceEngine, OutputDevice};
use crate::realtime;
use crate::shared_counters::{BarrierOutcome, SharedCountersBlock};
use crate::shutdown::ShutdownToken;
use crate::stages::{self, ExitReason, StageKind, StageSummary};
use crate::stats::{ChannelOutcome, ChannelReport, RunReport};
use crate::storage::{self, CsvSink, DiskSpaceGuard};
use crate::types::ChannelId;

/// Number of channel supervisors meeting at the startup barrier.
const BARRIER_PARTICIPANTS: u64 = ChannelId::ALL.len() as u64;

/// Lifecycle state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PipelineState {
    /// Configuring devices and files
    Init,
    /// Waiting for the peer channel at the startup barrier
    BarrierWait,
    /// Stage threads running
    Running,
    /// Acquisition finished, consumers draining
    Draining,
    /// All stage threads joined
    Done,
}

struct Lifecycle {
    channel: ChannelId,
    state: PipelineState,
}

impl Lifecycle {
    fn new(channel: ChannelId) -> Self {
        info!(%channel, state = ?PipelineState::Init, "Channel lifecycle started");
        Self {
            channel,
            state: PipelineState::Init,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        info!(channel = %self.channel, from = ?self.state, to = ?next, "Channel state changed");
        self.state = next;
    }
}

/// The collaborators one channel runs with.
pub struct ChannelDevices {
    /// Source of raw windows
    pub acquisition: Box<dyn AcquisitionDevice>,
    /// Analog output, required only when a device sink is enabled
    pub output: Option<Box<dyn OutputDevice>>,
    /// Model run on every window
    pub engine: Box<dyn InferenceEngine>,
}

/// Everything a supervisor needs to know about its channel, resolved before spawning.
#[derive(Debug, Clone)]
struct ChannelPlan {
    id: ChannelId,
    sinks: SinkSelection,
    settings: AcquisitionSettings,
    core: Option<usize>,
    inference_priority: Option<i32>,
    raw_path: Option<PathBuf>,
    result_path: Option<PathBuf>,
    data_dir: PathBuf,
    model_dir: PathBuf,
    disk_threshold: u64,
    disk_check_interval: u64,
}

impl ChannelPlan {
    fn new(id: ChannelId, sinks: SinkSelection, config: &PipelineConfig) -> Self {
        let store = &config.storage;
        let rt = &config.realtime;
        Self {
            id,
            sinks,
            settings: AcquisitionSettings::from(&config.acquisition),
            core: rt.pin_channels.then(|| rt.channel_cores[id.index()]),
            inference_priority: rt.elevate_inference.then_some(rt.inference_priority),
            raw_path: sinks
                .raw_to_file
                .then(|| storage::raw_file_path(&store.data_dir, id)),
            result_path: sinks
                .result_to_file
                .then(|| storage::result_file_path(&store.model_dir, id)),
            data_dir: store.data_dir.clone(),
            model_dir: store.model_dir.clone(),
            disk_threshold: store.disk_space_threshold_bytes,
            disk_check_interval: store.disk_check_interval,
        }
    }
}

struct FileSinks {
    raw: Option<CsvSink>,
    result: Option<CsvSink>,
}

/// Arrives at the startup barrier exactly once: either by waiting on it, or on drop.
struct BarrierTicket<'a> {
    block: &'a SharedCountersBlock,
    spent: bool,
}

impl<'a> BarrierTicket<'a> {
    fn new(block: &'a SharedCountersBlock) -> Self {
        Self {
            block,
            spent: false,
        }
    }

    fn wait(mut self, shutdown: &ShutdownToken) -> BarrierOutcome {
        self.spent = true;
        self.block.wait_for_barrier(BARRIER_PARTICIPANTS, shutdown)
    }
}

impl Drop for BarrierTicket<'_> {
    fn drop(&mut self) {
        if !self.spent {
            self.block.arrive();
        }
    }
}

struct ChannelRun {
    outcome: ChannelOutcome,
    stages: Vec<StageSummary>,
}

impl ChannelRun {
    fn failed(reason: String) -> Self {
        Self {
            outcome: ChannelOutcome::Failed(reason),
            stages: Vec::new(),
        }
    }
}

/// A configured two-channel pipeline.
///
/// # Example
/// ```rust,ignore
/// let pipeline = Pipeline::new(PipelineConfig::default());
/// let report = pipeline.run([devices_ch1, devices_ch2])?;
/// println!("{}", report);
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    shutdown: ShutdownToken,
}

impl Pipeline {
    /// Pipeline with its own shutdown token.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_shutdown(config, ShutdownToken::new())
    }

    /// Pipeline cancelled through an externally owned token.
    pub fn with_shutdown(config: PipelineConfig, shutdown: ShutdownToken) -> Self {
        Self { config, shutdown }
    }

    /// Handle that stops the run when triggered.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Configuration the pipeline runs with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run both channels to completion and report what they did.
    ///
    /// Returns `Err` only for failures that prevent the run as a whole: invalid
    /// configuration, output folders that cannot be prepared, or a shared counters segment
    /// that cannot be created. A channel that fails on its own is reported as
    /// [`ChannelOutcome::Failed`] while the other channel runs normally.
    pub fn run(&self, devices: [ChannelDevices; 2]) -> PipelineResult<RunReport> {
        self.config.validate()?;
        let (sinks, _warnings) = self.config.sinks.resolve();
        if sinks.is_empty() {
            info!("No sinks enabled, running acquisition and inference only");
        }

        if sinks.raw_to_file {
            storage::prepare_output_dir(&self.config.storage.data_dir)?;
        }
        if sinks.result_to_file {
            storage::prepare_output_dir(&self.config.storage.model_dir)?;
        }

        let block = Arc::new(SharedCountersBlock::create(
            &self.config.shared_memory_dir(),
            &self.config.shared_memory.name,
        )?);
        info!(path = %block.path().display(), "Shared counters segment ready");

        let mut runs: Vec<(ChannelId, ChannelRun)> = thread::scope(|scope| {
            let mut supervisors = Vec::new();
            let mut runs = Vec::new();

            for (id, channel_devices) in ChannelId::ALL.into_iter().zip(devices) {
                let plan = ChannelPlan::new(id, sinks, &self.config);
                let worker_block = Arc::clone(&block);
                let shutdown = self.shutdown.clone();

                let spawned = thread::Builder::new()
                    .name(format!("ch{}-supervisor", id.number()))
                    .spawn_scoped(scope, move || {
                        supervise(plan, channel_devices, worker_block, shutdown)
                    });
                match spawned {
                    Ok(handle) => supervisors.push((id, handle)),
                    Err(source) => {
                        let err = PipelineError::ThreadSpawn {
                            name: format!("ch{}-supervisor", id.number()),
                            source,
                        };
                        error!(channel = %id, "{}", err);
                        // Stand in at the barrier for the channel that never started.
                        block.arrive();
                        runs.push((id, ChannelRun::failed(err.to_string())));
                    }
                }
            }

            for (id, handle) in supervisors {
                let run = handle.join().unwrap_or_else(|_| {
                    error!(channel = %id, "Channel supervisor panicked");
                    ChannelRun::failed("supervisor panicked".to_string())
                });
                runs.push((id, run));
            }
            runs
        });
        runs.sort_by_key(|(id, _)| *id);

        let stats = block.snapshot();
        let channels = runs
            .into_iter()
            .map(|(id, run)| ChannelReport {
                channel: id,
                outcome: run.outcome,
                stats: stats[id.index()],
                stages: run.stages,
            })
            .collect();

        let report = RunReport { sinks, channels };
        if report.has_failures() {
            warn!("Run finished with failed channels");
        } else {
            info!("Run finished");
        }
        Ok(report)
    }
}

fn supervise(
    plan: ChannelPlan,
    devices: ChannelDevices,
    block: Arc<SharedCountersBlock>,
    shutdown: ShutdownToken,
) -> ChannelRun {
    let id = plan.id;
    let mut lifecycle = Lifecycle::new(id);
    let ticket = BarrierTicket::new(&block);

    if let Some(core) = plan.core {
        match realtime::pin_current_thread(core) {
            Ok(()) => info!(channel = %id, core, "Channel pinned to core"),
            Err(e) => warn!(channel = %id, core, "Could not pin channel to core: {}", e),
        }
    }

    let ChannelDevices {
        mut acquisition,
        mut output,
        mut engine,
    } = devices;

    let files = match prepare(&plan, acquisition.as_mut(), &mut output) {
        Ok(files) => files,
        Err(e) => {
            error!(channel = %id, "Channel setup failed: {}", e);
            drop(ticket);
            lifecycle.advance(PipelineState::Done);
            return ChannelRun::failed(e.to_string());
        }
    };

    let channel = Channel::new(id, plan.sinks, Arc::clone(&block), shutdown.clone());

    lifecycle.advance(PipelineState::BarrierWait);
    if ticket.wait(&shutdown) == BarrierOutcome::Cancelled {
        info!(channel = %id, "Shutdown requested before sampling started");
        lifecycle.advance(PipelineState::Done);
        return ChannelRun {
            outcome: ChannelOutcome::Interrupted,
            stages: Vec::new(),
        };
    }

    lifecycle.advance(PipelineState::Running);
    let stages = run_stages(
        &plan,
        &channel,
        acquisition.as_mut(),
        output,
        engine.as_mut(),
        files,
        &mut lifecycle,
    );
    lifecycle.advance(PipelineState::Done);
    channel.report_leftovers();

    let outcome = if shutdown.is_triggered() {
        ChannelOutcome::Interrupted
    } else {
        ChannelOutcome::Completed
    };
    ChannelRun { outcome, stages }
}

fn prepare(
    plan: &ChannelPlan,
    acquisition: &mut dyn AcquisitionDevice,
    output: &mut Option<Box<dyn OutputDevice>>,
) -> PipelineResult<FileSinks> {
    let device_error = |message: String| PipelineError::DeviceInit {
        channel: plan.id,
        message,
    };

    acquisition
        .configure(plan.id, &plan.settings)
        .map_err(|e| device_error(format!("{:#}", e)))?;

    if plan.sinks.raw_to_device || plan.sinks.result_to_device {
        let output = output.as_mut().ok_or_else(|| {
            device_error("a device sink is enabled but no output device was supplied".into())
        })?;
        output
            .configure(plan.id)
            .map_err(|e| device_error(format!("{:#}", e)))?;
    }

    let raw = plan.raw_path.as_ref().map(CsvSink::create).transpose()?;
    let result = plan.result_path.as_ref().map(CsvSink::create).transpose()?;
    Ok(FileSinks { raw, result })
}

fn spawn_stage<'scope, F>(
    scope: &'scope Scope<'scope, '_>,
    channel: ChannelId,
    stage: StageKind,
    body: F,
) -> std::io::Result<ScopedJoinHandle<'scope, StageSummary>>
where
    F: FnOnce() -> StageSummary + Send + 'scope,
{
    thread::Builder::new()
        .name(stage.thread_name(channel))
        .spawn_scoped(scope, body)
}

/// Release whatever would have been consumed or produced by a stage that never started.
fn stage_not_started(channel: &Channel, stage: StageKind, error: std::io::Error) -> StageSummary {
    error!(channel = %channel.id(), %stage, "Failed to spawn stage thread: {}", error);
    match stage {
        StageKind::Acquisition => channel.close_windows(),
        StageKind::Inference => {
            channel.abandon_window_queue(WindowQueue::Inference);
            channel.close_results();
        }
        StageKind::RawToFile => {
            channel.abandon_window_queue(WindowQueue::RawToFile);
        }
        StageKind::RawToDevice => {
            channel.abandon_window_queue(WindowQueue::RawToDevice);
        }
        StageKind::ResultToFile => {
            channel.abandon_result_buffer(ResultBuffer::ToFile);
        }
        StageKind::ResultToDevice => {
            channel.abandon_result_buffer(ResultBuffer::ToDevice);
        }
    }
    StageSummary {
        stage,
        items: 0,
        reason: ExitReason::Failed(format!("thread spawn failed: {}", error)),
    }
}

fn join_stage(
    channel: ChannelId,
    stage: StageKind,
    handle: ScopedJoinHandle<'_, StageSummary>,
) -> StageSummary {
    handle.join().unwrap_or_else(|_| {
        error!(%channel, %stage, "Stage thread panicked");
        StageSummary {
            stage,
            items: 0,
            reason: ExitReason::Failed("thread panicked".to_string()),
        }
    })
}

fn started<'scope>(
    channel: &Channel,
    stage: StageKind,
    spawned: std::io::Result<ScopedJoinHandle<'scope, StageSummary>>,
    summaries: &mut Vec<StageSummary>,
) -> Option<ScopedJoinHandle<'scope, StageSummary>> {
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            summaries.push(stage_not_started(channel, stage, e));
            None
        }
    }
}

fn run_stages(
    plan: &ChannelPlan,
    channel: &Channel,
    acquisition: &mut dyn AcquisitionDevice,
    mut output: Option<Box<dyn OutputDevice>>,
    engine: &mut dyn InferenceEngine,
    files: FileSinks,
    lifecycle: &mut Lifecycle,
) -> Vec<StageSummary> {
    let id = plan.id;
    let FileSinks { raw, result } = files;

    thread::scope(|scope| {
        let mut summaries = Vec::new();
        let mut consumers = Vec::new();

        if let Some(mut sink) = raw {
            let mut disk =
                DiskSpaceGuard::new(&plan.data_dir, plan.disk_threshold, plan.disk_check_interval);
            let spawned = spawn_stage(scope, id, StageKind::RawToFile, move || {
                stages::run_raw_to_file(channel, &mut sink, &mut disk)
            });
            if let Some(handle) = started(channel, StageKind::RawToFile, spawned, &mut summaries) {
                consumers.push((StageKind::RawToFile, handle));
            }
        }

        if plan.sinks.raw_to_device {
            if let Some(mut device) = output.take() {
                let spawned = spawn_stage(scope, id, StageKind::RawToDevice, move || {
                    stages::run_raw_to_device(channel, device.as_mut())
                });
                if let Some(handle) = started(channel, StageKind::RawToDevice, spawned, &mut summaries) {
                    consumers.push((StageKind::RawToDevice, handle));
                }
            }
        }

        if let Some(mut sink) = result {
            let mut disk =
                DiskSpaceGuard::new(&plan.model_dir, plan.disk_threshold, plan.disk_check_interval);
            let spawned = spawn_stage(scope, id, StageKind::ResultToFile, move || {
                stages::run_result_to_file(channel, &mut sink, &mut disk)
            });
            if let Some(handle) = started(channel, StageKind::ResultToFile, spawned, &mut summaries) {
                consumers.push((StageKind::ResultToFile, handle));
            }
        }

        if plan.sinks.result_to_device {
            if let Some(mut device) = output.take() {
                let spawned = spawn_stage(scope, id, StageKind::ResultToDevice, move || {
                    stages::run_result_to_device(channel, device.as_mut())
                });
                if let Some(handle) = started(channel, StageKind::ResultToDevice, spawned, &mut summaries) {
                    consumers.push((StageKind::ResultToDevice, handle));
                }
            }
        }

        let priority = plan.inference_priority;
        let spawned = spawn_stage(scope, id, StageKind::Inference, move || {
            if let Some(priority) = priority {
                match realtime::elevate_current_thread(priority) {
                    Ok(()) => info!(channel = %id, priority, "Inference running with SCHED_FIFO"),
                    Err(e) => warn!(
                        channel = %id,
                        priority,
                        "Could not raise inference priority, using default scheduling: {}",
                        e
                    ),
                }
            }
            stages::run_inference(channel, engine)
        });
        let inference = started(channel, StageKind::Inference, spawned, &mut summaries);

        let spawned = spawn_stage(scope, id, StageKind::Acquisition, move || {
            stages::run_acquisition(channel, acquisition)
        });
        let acquire = started(channel, StageKind::Acquisition, spawned, &mut summaries);

        if let Some(handle) = acquire {
            summaries.push(join_stage(id, StageKind::Acquisition, handle));
        }
        lifecycle.advance(PipelineState::Draining);
        if let Some(handle) = inference {
            summaries.push(join_stage(id, StageKind::Inference, handle));
        }
        for (stage, handle) in consumers {
            summaries.push(join_stage(id, stage, handle));
        }
        summaries
    })
}
