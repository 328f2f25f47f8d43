//! Cross-channel statistics block in a named, memory-mapped segment.
//!
//! Every stage of both channels bumps counters in this block without taking a lock: each
//! field is an independent atomic and no invariant spans two fields. The block also holds
//! the startup barrier counter both channel supervisors spin on before sampling begins.
//!
//! # Memory Layout
//! ```text
//! [64-byte header] [128-byte slot CH1] [128-byte slot CH2]
//!
//! Header:
//!   magic: u64               (0xDA_DA_C0_C0_00_00_00_02)
//!   slots: u64               (number of channel slots, always 2)
//!   ready_barrier: AtomicU64 (startup barrier arrivals)
//!   padding: [u8; 40]
//!
//! Slot (two cache lines, so the channels never share one):
//!   acquire_count .. result_device_count: AtomicU64 x 6
//!   trigger_time_ns, end_time_ns:          AtomicU64 x 2
//!   padding: [u8; 64]
//! ```
//!
//! The segment is owned by [`SharedCountersBlock`]: creating it maps the file, and
//! dropping the owning handle unmaps and unlinks it on every exit path.

use crate::error::{PipelineError, PipelineResult};
use crate::shutdown::ShutdownToken;
use crate::stats::ChannelStats;
use crate::types::ChannelId;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Magic number for segment validation.
const MAGIC: u64 = 0xDA_DA_C0_C0_00_00_00_02;

/// Number of channel slots in the segment.
const SLOT_COUNT: usize = 2;

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = 128;

/// Total size of the mapped segment in bytes.
pub const SEGMENT_SIZE: usize = HEADER_SIZE + SLOT_COUNT * SLOT_SIZE;

#[repr(C)]
struct SegmentHeader {
    magic: u64,
    slots: u64,
    ready_barrier: AtomicU64,
    _padding: [u8; 40],
}

/// Per-channel statistics living in shared memory.
///
/// Obtained through [`SharedCountersBlock::slot`]; never constructed directly.
#[repr(C)]
pub struct SharedCounters {
    acquire_count: AtomicU64,
    model_count: AtomicU64,
    raw_file_count: AtomicU64,
    raw_device_count: AtomicU64,
    result_file_count: AtomicU64,
    result_device_count: AtomicU64,
    trigger_time_ns: AtomicU64,
    end_time_ns: AtomicU64,
    _padding: [u8; 64],
}

const _: () = assert!(size_of::<SegmentHeader>() == HEADER_SIZE);
const _: () = assert!(size_of::<SharedCounters>() == SLOT_SIZE);

/// Event counters kept per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Windows read from the acquisition device.
    Acquired,
    /// Windows run through the inference engine.
    Processed,
    /// Raw windows appended to the channel's data file.
    RawToFile,
    /// Raw windows forwarded to the output device.
    RawToDevice,
    /// Inference results appended to the channel's result file.
    ResultToFile,
    /// Inference results driven onto the output device.
    ResultToDevice,
}

impl SharedCounters {
    fn field(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Acquired => &self.acquire_count,
            Counter::Processed => &self.model_count,
            Counter::RawToFile => &self.raw_file_count,
            Counter::RawToDevice => &self.raw_device_count,
            Counter::ResultToFile => &self.result_file_count,
            Counter::ResultToDevice => &self.result_device_count,
        }
    }

    /// Add one to `counter`.
    pub fn increment(&self, counter: Counter) {
        self.field(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of `counter`.
    pub fn get(&self, counter: Counter) -> u64 {
        self.field(counter).load(Ordering::Relaxed)
    }

    /// Record the hardware trigger time. Only the first call has an effect.
    pub fn record_trigger(&self, nanos: u64) {
        let _ = self.trigger_time_ns.compare_exchange(
            0,
            nanos,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Record the time the channel stopped acquiring.
    pub fn record_end(&self, nanos: u64) {
        self.end_time_ns.store(nanos, Ordering::Release);
    }

    /// Trigger timestamp in nanoseconds since the Unix epoch, or 0 if never triggered.
    pub fn trigger_time_ns(&self) -> u64 {
        self.trigger_time_ns.load(Ordering::Acquire)
    }

    /// End timestamp in nanoseconds since the Unix epoch, or 0 if not finished.
    pub fn end_time_ns(&self) -> u64 {
        self.end_time_ns.load(Ordering::Acquire)
    }

    /// Copy every field into a plain snapshot.
    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            acquired: self.get(Counter::Acquired),
            processed: self.get(Counter::Processed),
            raw_to_file: self.get(Counter::RawToFile),
            raw_to_device: self.get(Counter::RawToDevice),
            results_to_file: self.get(Counter::ResultToFile),
            results_to_device: self.get(Counter::ResultToDevice),
            trigger_time_ns: self.trigger_time_ns(),
            end_time_ns: self.end_time_ns(),
        }
    }

    fn reset(&self) {
        for counter in [
            Counter::Acquired,
            Counter::Processed,
            Counter::RawToFile,
            Counter::RawToDevice,
            Counter::ResultToFile,
            Counter::ResultToDevice,
        ] {
            self.field(counter).store(0, Ordering::Relaxed);
        }
        self.trigger_time_ns.store(0, Ordering::Relaxed);
        self.end_time_ns.store(0, Ordering::Relaxed);
    }
}

/// Outcome of waiting at the startup barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every participant arrived.
    Released,
    /// Shutdown was requested before every participant arrived.
    Cancelled,
}

/// Owner of the memory-mapped statistics segment.
///
/// The handle that created the segment unlinks the backing file when dropped; handles
/// obtained with [`SharedCountersBlock::open`] only unmap.
pub struct SharedCountersBlock {
    mmap: MmapMut,
    path: PathBuf,
    owner: bool,
}

impl SharedCountersBlock {
    /// Create (or truncate) the named segment `name` inside `dir` and zero every counter.
    pub fn create(dir: &Path, name: &str) -> PipelineResult<Self> {
        let path = dir.join(name.trim_start_matches('/'));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                PipelineError::SharedMemory(format!(
                    "failed to create segment {}: {}",
                    path.display(),
                    e
                ))
            })?;

        file.set_len(SEGMENT_SIZE as u64).map_err(|e| {
            PipelineError::SharedMemory(format!("failed to size segment: {}", e))
        })?;

        // SAFETY: the file was just created with SEGMENT_SIZE bytes and nobody else maps it
        // before this handle publishes it.
        let mut mmap = unsafe {
            MmapOptions::new()
                .len(SEGMENT_SIZE)
                .map_mut(&file)
                .map_err(|e| PipelineError::SharedMemory(format!("mapping failed: {}", e)))?
        };

        // SAFETY: the mapping is page aligned and at least HEADER_SIZE bytes long.
        unsafe {
            let header = mmap.as_mut_ptr() as *mut SegmentHeader;
            (*header).magic = MAGIC;
            (*header).slots = SLOT_COUNT as u64;
            (*header)._padding.fill(0);
        }

        let block = Self {
            mmap,
            path,
            owner: true,
        };
        block.header().ready_barrier.store(0, Ordering::Release);
        for channel in ChannelId::ALL {
            block.slot(channel).reset();
        }

        debug!(path = %block.path.display(), size = SEGMENT_SIZE, "Created shared counters segment");
        Ok(block)
    }

    /// Attach to a segment created by another handle or process.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                PipelineError::SharedMemory(format!(
                    "failed to open segment {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let len = file.metadata()?.len();
        if len < SEGMENT_SIZE as u64 {
            return Err(PipelineError::SharedMemory(format!(
                "segment {} is {} bytes, expected {}",
                path.display(),
                len,
                SEGMENT_SIZE
            )));
        }

        // SAFETY: the length was validated above; the creator initialised the header.
        let mmap = unsafe {
            MmapOptions::new()
                .len(SEGMENT_SIZE)
                .map_mut(&file)
                .map_err(|e| PipelineError::SharedMemory(format!("mapping failed: {}", e)))?
        };

        let block = Self {
            mmap,
            path: path.to_path_buf(),
            owner: false,
        };

        let header = block.header();
        if header.magic != MAGIC || header.slots != SLOT_COUNT as u64 {
            return Err(PipelineError::SharedMemory(format!(
                "invalid segment header: magic 0x{:016X}, {} slots",
                header.magic, header.slots
            )));
        }

        Ok(block)
    }

    /// Default directory for named segments: `/dev/shm` where it exists.
    pub fn default_dir() -> PathBuf {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is SEGMENT_SIZE bytes long and lives as long as `self`.
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    /// Counters of one channel.
    pub fn slot(&self, channel: ChannelId) -> &SharedCounters {
        let offset = HEADER_SIZE + channel.index() * SLOT_SIZE;
        // SAFETY: offset + SLOT_SIZE <= SEGMENT_SIZE and the offset keeps 8-byte alignment.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const SharedCounters) }
    }

    /// Snapshot of both channels, in slot order.
    pub fn snapshot(&self) -> [ChannelStats; SLOT_COUNT] {
        [
            self.slot(ChannelId::Ch1).snapshot(),
            self.slot(ChannelId::Ch2).snapshot(),
        ]
    }

    /// Register one arrival at the startup barrier without waiting.
    ///
    /// Used by a channel that failed setup so that its peer is not held back.
    pub fn arrive(&self) -> u64 {
        self.header().ready_barrier.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of arrivals at the startup barrier so far.
    pub fn barrier_arrivals(&self) -> u64 {
        self.header().ready_barrier.load(Ordering::Acquire)
    }

    /// Arrive at the startup barrier and yield until `participants` have arrived.
    ///
    /// The wait is cooperative (`yield_now`), never blocking, and gives up when
    /// `shutdown` is triggered.
    pub fn wait_for_barrier(&self, participants: u64, shutdown: &ShutdownToken) -> BarrierOutcome {
        self.arrive();
        let mut spins: u64 = 0;
        while self.barrier_arrivals() < participants {
            if shutdown.is_triggered() {
                return BarrierOutcome::Cancelled;
            }
            spins += 1;
            if spins % 10_000 == 0 {
                thread::sleep(Duration::from_micros(50));
            } else {
                thread::yield_now();
            }
        }
        BarrierOutcome::Released
    }
}

impl Drop for SharedCountersBlock {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to unlink shared counters: {}", e);
            } else {
                debug!(path = %self.path.display(), "Unlinked shared counters segment");
            }
        }
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_create_zeroes_counters() {
        let temp_dir = tempfile::tempdir().unwrap();
        let block = SharedCountersBlock::create(temp_dir.path(), "counters").unwrap();

        for channel in ChannelId::ALL {
            let stats = block.slot(channel).snapshot();
            assert_eq!(stats, ChannelStats::default());
        }
        assert_eq!(block.barrier_arrivals(), 0);
    }

    #[test]
    fn test_slots_are_independent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let block = SharedCountersBlock::create(temp_dir.path(), "counters").unwrap();

        block.slot(ChannelId::Ch1).increment(Counter::Acquired);
        block.slot(ChannelId::Ch1).increment(Counter::Acquired);
        block.slot(ChannelId::Ch2).increment(Counter::ResultToDevice);

        let [ch1, ch2] = block.snapshot();
        assert_eq!(ch1.acquired, 2);
        assert_eq!(ch1.results_to_device, 0);
        assert_eq!(ch2.acquired, 0);
        assert_eq!(ch2.results_to_device, 1);
    }

    #[test]
    fn test_second_mapping_sees_updates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let owner = SharedCountersBlock::create(temp_dir.path(), "counters").unwrap();
        let attached = SharedCountersBlock::open(owner.path()).unwrap();

        attached.slot(ChannelId::Ch2).increment(Counter::Processed);
        attached.slot(ChannelId::Ch2).record_trigger(1_000);

        assert_eq!(owner.slot(ChannelId::Ch2).get(Counter::Processed), 1);
        assert_eq!(owner.slot(ChannelId::Ch2).trigger_time_ns(), 1_000);
    }

    #[test]
    fn test_trigger_time_is_write_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let block = SharedCountersBlock::create(temp_dir.path(), "counters").unwrap();
        let slot = block.slot(ChannelId::Ch1);

        slot.record_trigger(500);
        slot.record_trigger(900);
        slot.record_end(1_500);

        assert_eq!(slot.trigger_time_ns(), 500);
        assert_eq!(slot.end_time_ns(), 1_500);
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = {
            let block = SharedCountersBlock::create(temp_dir.path(), "/counters").unwrap();
            let path = block.path().to_path_buf();
            assert!(path.exists());
            let attached = SharedCountersBlock::open(&path).unwrap();
            drop(attached);
            assert!(path.exists(), "attached handle must not unlink");
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("garbage");
        std::fs::write(&path, vec![0xFF; SEGMENT_SIZE]).unwrap();

        assert!(matches!(
            SharedCountersBlock::open(&path),
            Err(PipelineError::SharedMemory(_))
        ));
    }

    #[test]
    fn test_barrier_releases_both_participants() {
        let temp_dir = tempfile::tempdir().unwrap();
        let block = Arc::new(SharedCountersBlock::create(temp_dir.path(), "counters").unwrap());
        let shutdown = ShutdownToken::new();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let block = Arc::clone(&block);
                let shutdown = shutdown.clone();
                thread::spawn(move || block.wait_for_barrier(2, &shutdown))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), BarrierOutcome::Released);
        }
        assert_eq!(block.barrier_arrivals(), 2);
    }

    #[test]
    fn test_barrier_cancelled_by_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let block = SharedCountersBlock::create(temp_dir.path(), "counters").unwrap();
        let shutdown = ShutdownToken::new();
        shutdown.trigger();

        assert_eq!(block.wait_for_barrier(2, &shutdown), BarrierOutcome::Cancelled);
    }
}
