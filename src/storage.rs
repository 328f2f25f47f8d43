//! File persistence for the output stages.
//!
//! Each enabled file sink owns one [`CsvSink`] for its channel. Files are created fresh at
//! the start of a run (any prior content is truncated) and receive one row per record:
//!
//! - raw windows (`data_ch{N}.csv`): `timestamp,sequence,s0,s1,...`
//! - inference results (`output_ch{N}.csv`): `sequence,computation_us,o0,o1,...`
//!
//! The header row is written with the first record, once the record width is known.

use crate::error::PipelineResult;
use crate::types::{ChannelId, InferenceResult, SampleWindow};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A record shape that can be appended to a CSV sink.
pub trait CsvRecord {
    /// Column names for a record of this shape.
    fn header(&self) -> Vec<String>;

    /// Field values, in header order.
    fn fields(&self) -> Vec<String>;
}

impl CsvRecord for SampleWindow {
    fn header(&self) -> Vec<String> {
        let mut header = vec!["timestamp".to_string(), "sequence".to_string()];
        header.extend((0..self.samples.len()).map(|i| format!("s{}", i)));
        header
    }

    fn fields(&self) -> Vec<String> {
        let timestamp: DateTime<Utc> = self.captured_at.into();
        let mut fields = vec![
            timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.sequence.to_string(),
        ];
        fields.extend(self.samples.iter().map(|s| s.to_string()));
        fields
    }
}

impl CsvRecord for InferenceResult {
    fn header(&self) -> Vec<String> {
        let mut header = vec!["sequence".to_string(), "computation_us".to_string()];
        header.extend((0..self.output.len()).map(|i| format!("o{}", i)));
        header
    }

    fn fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.sequence.to_string(),
            self.computation_time.as_micros().to_string(),
        ];
        fields.extend(self.output.iter().map(|v| v.to_string()));
        fields
    }
}

/// Per-channel, per-sink CSV file.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    header_written: bool,
    records: u64,
}

impl CsvSink {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        let writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        debug!(path = %path.display(), "CSV sink created");

        Ok(Self {
            path,
            writer,
            header_written: false,
            records: 0,
        })
    }

    /// Append one record, writing the header first if this is the first record.
    pub fn append_record<R: CsvRecord>(&mut self, record: &R) -> PipelineResult<()> {
        if !self.header_written {
            self.writer.write_record(record.header())?;
            self.header_written = true;
        }
        self.writer.write_record(record.fields())?;
        self.records += 1;
        Ok(())
    }

    /// Flush buffered rows to the file.
    pub fn flush(&mut self) -> PipelineResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Records appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), "Failed to flush CSV sink: {}", e);
        }
    }
}

/// Path of the raw-sample file for `channel` inside `dir`.
pub fn raw_file_path(dir: &Path, channel: ChannelId) -> PathBuf {
    dir.join(format!("data_ch{}.csv", channel.number()))
}

/// Path of the result file for `channel` inside `dir`.
pub fn result_file_path(dir: &Path, channel: ChannelId) -> PathBuf {
    dir.join(format!("output_ch{}.csv", channel.number()))
}

/// Make `dir` exist and be empty.
///
/// An existing directory has its entries removed; a missing one is created.
pub fn prepare_output_dir(dir: &Path) -> PipelineResult<()> {
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        info!(dir = %dir.display(), "Cleared output folder");
    } else {
        fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "Created output folder");
    }
    Ok(())
}

/// Free space available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::zeroed();

    // SAFETY: c_path is NUL-terminated and stat points to writable memory sized for statvfs.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs returned success, so the structure is fully initialised.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    let bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    Ok(bytes)
}

/// Free space is not checked on this platform.
#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}

/// Periodic free-disk-space check used by the file writers.
///
/// Every `interval` calls to [`DiskSpaceGuard::has_room`] the free space of `dir` is
/// measured; once it drops below `threshold` bytes the guard reports no room for good.
#[derive(Debug)]
pub struct DiskSpaceGuard {
    dir: PathBuf,
    threshold: u64,
    interval: u64,
    calls: u64,
    exhausted: bool,
}

impl DiskSpaceGuard {
    /// Guard `dir`. A zero `threshold` disables the check.
    pub fn new(dir: impl Into<PathBuf>, threshold: u64, interval: u64) -> Self {
        Self {
            dir: dir.into(),
            threshold,
            interval: interval.max(1),
            calls: 0,
            exhausted: false,
        }
    }

    /// Whether another record may be written.
    pub fn has_room(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if self.threshold == 0 {
            return true;
        }

        let due = self.calls % self.interval == 0;
        self.calls += 1;
        if !due {
            return true;
        }

        match available_space(&self.dir) {
            Ok(free) if free < self.threshold => {
                warn!(
                    dir = %self.dir.display(),
                    free_bytes = free,
                    threshold_bytes = self.threshold,
                    "Disk space below threshold, stopping file output"
                );
                self.exhausted = true;
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(dir = %self.dir.display(), "Could not read filesystem statistics: {}", e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_raw_rows_have_header_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = raw_file_path(dir.path(), ChannelId::Ch1);
        let mut sink = CsvSink::create(&path).unwrap();

        sink.append_record(&SampleWindow::new(0, vec![0.5, -0.25]))
            .unwrap();
        sink.append_record(&SampleWindow::new(1, vec![0.0, 1.0]))
            .unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.records(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = reader
            .headers()
            .unwrap()
            .iter()
            .map(str::to_string)
            .collect();
        assert_eq!(header, vec!["timestamp", "sequence", "s0", "s1"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "0");
        assert_eq!(&rows[0][2], "0.5");
        assert_eq!(&rows[1][3], "1");
        assert!(DateTime::parse_from_rfc3339(&rows[0][0]).is_ok());
    }

    #[test]
    fn test_result_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = result_file_path(dir.path(), ChannelId::Ch2);
        assert!(path.ends_with("output_ch2.csv"));

        let mut sink = CsvSink::create(&path).unwrap();
        sink.append_record(&InferenceResult {
            sequence: 4,
            output: vec![0.125],
            computation_time: Duration::from_micros(250),
        })
        .unwrap();
        drop(sink);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "sequence,computation_us,o0\n4,250,0.125\n");
    }

    #[test]
    fn test_create_truncates_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_ch1.csv");
        fs::write(&path, "stale\n").unwrap();

        let sink = CsvSink::create(&path).unwrap();
        drop(sink);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_prepare_output_dir_creates_and_empties() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("DataOutput");

        prepare_output_dir(&dir).unwrap();
        assert!(dir.is_dir());

        fs::write(dir.join("old.csv"), "1,2\n").unwrap();
        fs::create_dir(dir.join("nested")).unwrap();
        prepare_output_dir(&dir).unwrap();
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_disk_guard_disabled_by_zero_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = DiskSpaceGuard::new(dir.path(), 0, 1);
        assert!((0..10).all(|_| guard.has_room()));
    }

    #[test]
    fn test_disk_guard_trips_on_impossible_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = DiskSpaceGuard::new(dir.path(), u64::MAX, 1);
        assert!(!guard.has_room());
        assert!(!guard.has_room());
    }

    #[cfg(unix)]
    #[test]
    fn test_available_space_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_space(dir.path()).unwrap() > 0);
    }
}
