//! The rotating file sink: sole writer of one category's active log file.
//!
//! The sink lives in one of three states. It is open while writing to the
//! current period's file, rotating (transiently, under its lock) when a write
//! lands in a new period, and closed for good after [`RotatingFileSink::close`].

use {
    crate::{
        clock::{Clock, SystemClock},
        naming::{BackupNaming, RotationAge, TimeZone},
        retention::{Compression, RetentionPolicy, RetentionWorker},
        set_permissions, LogError,
    },
    chrono::{DateTime, FixedOffset, Utc},
    std::{
        fmt::Debug,
        fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    },
    tracing::{debug, warn},
};

/// Anything a category can be written to.
pub trait LogSink: Send + Sync {
    /// Append `buf` in full. Returns the number of bytes written.
    fn write(&self, buf: &[u8]) -> Result<usize, LogError>;

    /// Release the underlying output. Closing twice succeeds.
    fn close(&self) -> Result<(), LogError>;
}

/// Defines size thresholds for rotating log files in various units.
///
/// A size limit is an extra trigger on top of period rotation: when the next
/// write would push a non-empty active file past the limit, the file is
/// rotated first. Backups made this way within one period get a sequence
/// suffix (`app.log-2025-04-01-1`).
///
/// * `Bytes` - Direct byte count (e.g., 1048576 bytes)
/// * `KB` - Kilobytes (1 KB = 1024 bytes)
/// * `MB` - Megabytes (1 MB = 1024 KB)
/// * `GB` - Gigabytes (1 GB = 1024 MB)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationSize {
    /// Raw byte count
    Bytes(u64),
    /// Kilobytes (1 KB = 1024 bytes)
    KB(u64),
    /// Megabytes (1 MB = 1024 KB = 1,048,576 bytes)
    MB(u64),
    /// Gigabytes (1 GB = 1024 MB = 1,073,741,824 bytes)
    GB(u64),
}

impl RotationSize {
    /// Get the size of the log file in bytes.
    pub fn bytes(&self) -> u64 {
        match self {
            RotationSize::Bytes(b) => *b,
            RotationSize::KB(kb) => kb * 1024,
            RotationSize::MB(mb) => mb * 1024 * 1024,
            RotationSize::GB(gb) => gb * 1024 * 1024 * 1024,
        }
    }
}

/// Mutable state, guarded by the sink's mutex.
struct SinkState {
    /// `None` while closed, or after a rotation failed to reopen the file.
    file: Option<fs::File>,
    closed: bool,
    /// Period the active file was opened under.
    period: DateTime<FixedOffset>,
    /// Bytes in the active file.
    size_bytes: u64,
    /// Spawned on the first rotation that has retention work to do.
    retention: Option<RetentionWorker>,
}

/// A log file that rolls over when the wall-clock period changes.
///
/// Writes are serialized per sink: a rotation and the write that triggered it
/// form one critical section, so concurrent writers never interleave partial
/// lines and a period crossing causes exactly one rotation.
pub struct RotatingFileSink {
    path: PathBuf,
    policy: Arc<RetentionPolicy>,
    clock: Arc<dyn Clock>,
    max_size: Option<u64>,
    state: Mutex<SinkState>,
}

impl Debug for RotatingFileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingFileSink")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl RotatingFileSink {
    /// Open (or create) the active file at `path`.
    ///
    /// Missing parent directories are created. An existing non-empty file is
    /// appended to; if it was last modified in an earlier period, the first
    /// write rotates it out under that period's name.
    pub fn open<P: Into<PathBuf>>(
        path: P,
        policy: Arc<RetentionPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LogError> {
        Self::open_with_limit(path.into(), policy, clock, None)
    }

    fn open_with_limit(
        path: PathBuf,
        policy: Arc<RetentionPolicy>,
        clock: Arc<dyn Clock>,
        max_size: Option<u64>,
    ) -> Result<Self, LogError> {
        let current = policy.naming().period_start(clock.now());
        let existing = fs::metadata(&path).ok().filter(|meta| meta.len() > 0);
        let period = existing
            .as_ref()
            .and_then(|meta| meta.modified().ok())
            .map(|modified| policy.naming().period_start(DateTime::<Utc>::from(modified)))
            .filter(|modified| *modified < current)
            .unwrap_or(current);

        let file = create_log_file(&path, policy.mode())?;
        Ok(RotatingFileSink {
            state: Mutex::new(SinkState {
                file: Some(file),
                closed: false,
                period,
                size_bytes: existing.map_or(0, |meta| meta.len()),
                retention: None,
            }),
            path,
            policy,
            clock,
            max_size,
        })
    }

    /// Path of the active file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &Arc<RetentionPolicy> {
        &self.policy
    }

    pub fn is_open(&self) -> bool {
        !self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_open(&self) -> LogError {
        LogError::NotOpen(self.path.clone())
    }

    fn io_error(&self, err: io::Error) -> LogError {
        LogError::FileIOError {
            path: self.path.clone(),
            error: err.to_string(),
        }
    }

    /// Append `buf` to the active file, rotating first if the period changed.
    ///
    /// A zero-length write does nothing, not even a rotation.
    pub fn write(&self, buf: &[u8]) -> Result<usize, LogError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock();
        if state.closed {
            return Err(self.not_open());
        }

        let now = self.clock.now();
        let period = self.policy.naming().period_start(now);
        let oversized = self
            .max_size
            .is_some_and(|max| state.size_bytes > 0 && state.size_bytes + buf.len() as u64 > max);
        if period != state.period || oversized {
            self.rotate(&mut state, now, period)?;
        } else if state.file.is_none() {
            state.file = Some(create_log_file(&self.path, self.policy.mode())?);
        }

        let file = state.file.as_mut().ok_or_else(|| self.not_open())?;
        file.write_all(buf).map_err(|err| self.io_error(err))?;
        state.size_bytes += buf.len() as u64;
        Ok(buf.len())
    }

    /// Close the current file, move it to its backup name, open a fresh file
    /// and hand retention to the worker.
    fn rotate(&self, state: &mut SinkState, now: DateTime<Utc>, period: DateTime<FixedOffset>) -> Result<(), LogError> {
        if let Some(mut file) = state.file.take() {
            if let Err(err) = file.flush() {
                state.file = Some(file);
                return Err(self.io_error(err));
            }
        }

        // A fresh start with nothing written has nothing to back up.
        let has_content = fs::metadata(&self.path).map(|meta| meta.len() > 0).unwrap_or(false);
        if has_content {
            let backup = self
                .policy
                .naming()
                .name_for(&self.path, state.period.with_timezone(&Utc));
            if let Err(err) = fs::rename(&self.path, &backup) {
                // Keep writing to the old file; the next write retries the rotation.
                state.file = Some(create_log_file(&self.path, self.policy.mode())?);
                return Err(LogError::RenameFileError {
                    from: self.path.clone(),
                    to: backup,
                    error: err.to_string(),
                });
            }
            debug!(from = %self.path.display(), to = %backup.display(), "rotated log file");
        }

        state.file = Some(create_log_file(&self.path, self.policy.mode())?);
        state.period = period;
        state.size_bytes = 0;

        // Expired backups from an earlier run go even when nothing was rolled.
        self.schedule_retention(state, now);
        Ok(())
    }

    fn schedule_retention(&self, state: &mut SinkState, now: DateTime<Utc>) {
        if self.policy.is_noop() {
            return;
        }
        if state.retention.is_none() {
            match RetentionWorker::spawn(self.policy.clone(), self.path.clone()) {
                Ok(worker) => state.retention = Some(worker),
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "retention skipped");
                    return;
                }
            }
        }
        if let Some(worker) = &state.retention {
            worker.schedule(now);
        }
    }

    /// Flush the active file.
    pub fn flush(&self) -> Result<(), LogError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.not_open());
        }
        match state.file.as_mut() {
            Some(file) => file.flush().map_err(|err| self.io_error(err)),
            None => Ok(()),
        }
    }

    /// Flush and close the active file. Later writes fail with
    /// [`LogError::NotOpen`]. Closing a closed sink succeeds.
    ///
    /// Waits for any in-flight write or rotation to finish. Queued retention
    /// passes still run after the sink is closed.
    pub fn close(&self) -> Result<(), LogError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.retention = None;
        match state.file.take() {
            Some(mut file) => file.flush().map_err(|err| self.io_error(err)),
            None => Ok(()),
        }
    }
}

impl LogSink for RotatingFileSink {
    fn write(&self, buf: &[u8]) -> Result<usize, LogError> {
        RotatingFileSink::write(self, buf)
    }

    fn close(&self) -> Result<(), LogError> {
        RotatingFileSink::close(self)
    }
}

#[allow(clippy::io_other_error)]
impl io::Write for &RotatingFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RotatingFileSink::write(*self, buf).map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    }

    fn flush(&mut self) -> io::Result<()> {
        RotatingFileSink::flush(*self).map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

impl io::Write for RotatingFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        <&RotatingFileSink as io::Write>::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        <&RotatingFileSink as io::Write>::flush(&mut &*self)
    }
}

/// Create the log file at `log_path` for appending, creating its directory
/// first if needed.
fn create_log_file(log_path: &Path, file_mode: Option<u32>) -> Result<fs::File, LogError> {
    let mut open_options = fs::OpenOptions::new();
    open_options.append(true).create(true);

    let mut create_log_file_res = open_options.open(log_path);
    if create_log_file_res.is_err() {
        // Create the directory if it doesn't exist
        if let Some(parent) = log_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| LogError::CreateDirectoryFailed(parent.to_path_buf(), err.to_string()))?;
            create_log_file_res = open_options.open(log_path);
        }
    }

    let log_file =
        create_log_file_res.map_err(|err| LogError::CreateFileFailed(log_path.to_path_buf(), err.to_string()))?;

    set_permissions(log_path, file_mode)?;

    Ok(log_file)
}

/// Provides a fluent interface for configuring a [`RotatingFileSink`].
///
/// # Default Configuration
///
/// * Daily rotation at midnight, local time zone
/// * `-` between the file name and the period
/// * No compression, keep all backups
/// * No size limit
/// * System clock
///
/// # Examples
///
/// ```rust
/// use logkeeper::{Compression, RotatingFileSinkBuilder, RotationAge, RotationSize, TimeZone};
///
/// let dir = tempfile::tempdir().unwrap();
/// let sink = RotatingFileSinkBuilder::new(dir.path().join("app.log"))
///     .rotation(RotationAge::Hourly)
///     .time_zone(TimeZone::UTC)
///     .keep_days(2)
///     .compression(Compression::Gzip)
///     .max_size(RotationSize::MB(100))
///     .build()
///     .unwrap();
/// sink.write(b"started\n").unwrap();
/// ```
pub struct RotatingFileSinkBuilder {
    path: PathBuf,
    naming: BackupNaming,
    keep_days: u32,
    compression: Option<Compression>,
    file_mode: Option<u32>,
    policy: Option<Arc<RetentionPolicy>>,
    max_size: Option<RotationSize>,
    clock: Arc<dyn Clock>,
}

impl RotatingFileSinkBuilder {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        RotatingFileSinkBuilder {
            path: path.into(),
            naming: BackupNaming::default(),
            keep_days: 0,
            compression: None,
            file_mode: None,
            policy: None,
            max_size: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set how long one period lasts.
    pub fn rotation(self, rotation: RotationAge) -> Self {
        Self {
            naming: self.naming.with_granularity(rotation),
            ..self
        }
    }

    /// Set the time zone periods are evaluated in.
    pub fn time_zone(self, time_zone: TimeZone) -> Self {
        Self {
            naming: self.naming.with_time_zone(time_zone),
            ..self
        }
    }

    /// Set the separator between the file name and the period.
    pub fn delimiter<S: Into<String>>(self, delimiter: S) -> Self {
        Self {
            naming: self.naming.with_delimiter(delimiter),
            ..self
        }
    }

    pub fn keep_days(self, keep_days: u32) -> Self {
        Self { keep_days, ..self }
    }

    pub fn compression(self, compression: Compression) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Set the file permissions for log files (Unix-like systems only).
    /// For example, 0o644 for rw-r--r-- permissions.
    pub fn file_mode(self, mode: u32) -> Self {
        Self {
            file_mode: Some(mode),
            ..self
        }
    }

    /// Share an existing policy. Overrides the naming and retention setters.
    pub fn policy(self, policy: Arc<RetentionPolicy>) -> Self {
        Self {
            policy: Some(policy),
            ..self
        }
    }

    /// Also rotate when the active file would grow past `max_size`.
    pub fn max_size(self, max_size: RotationSize) -> Self {
        Self {
            max_size: Some(max_size),
            ..self
        }
    }

    pub fn clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    /// Build the sink and open its active file.
    pub fn build(self) -> Result<RotatingFileSink, LogError> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => {
                let mut policy = RetentionPolicy::new(self.naming).keep_days(self.keep_days);
                if let Some(compression) = self.compression {
                    policy = policy.compression(compression);
                }
                if let Some(mode) = self.file_mode {
                    policy = policy.file_mode(mode);
                }
                Arc::new(policy)
            }
        };
        RotatingFileSink::open_with_limit(self.path, policy, self.clock, self.max_size.map(|size| size.bytes()))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::clock::ManualClock,
        chrono::{Duration, TimeZone as _},
        std::thread,
        tempfile::TempDir,
    };

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap()))
    }

    fn sink(dir: &TempDir, name: &str, clock: &Arc<ManualClock>) -> RotatingFileSink {
        RotatingFileSinkBuilder::new(dir.path().join(name))
            .time_zone(TimeZone::UTC)
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    fn files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn writes_append_in_call_order() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = sink(&dir, "access.log", &clock);
        sink.write(b"one\n").unwrap();
        sink.write(b"two\n").unwrap();
        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = sink(&dir, "nested/deeper/access.log", &clock);
        sink.write(b"x").unwrap();
        assert!(dir.path().join("nested/deeper/access.log").exists());
    }

    #[test]
    fn period_crossing_rotates_exactly_once() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = sink(&dir, "access.log", &clock);
        sink.write(b"hello").unwrap();

        clock.advance(Duration::days(1));
        sink.write(b"world").unwrap();
        sink.write(b"!").unwrap();
        clock.advance(Duration::hours(3));
        sink.write(b"?").unwrap();

        assert_eq!(files(&dir), ["access.log", "access.log-2025-04-01"]);
        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "world!?");
        assert_eq!(
            fs::read_to_string(dir.path().join("access.log-2025-04-01")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn empty_write_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = sink(&dir, "stat.log", &clock);
        sink.write(b"data").unwrap();
        clock.advance(Duration::days(1));
        assert_eq!(sink.write(b"").unwrap(), 0);
        assert_eq!(files(&dir), ["stat.log"]);
    }

    #[test]
    fn rotation_without_content_skips_the_rename() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = sink(&dir, "slow.log", &clock);
        clock.advance(Duration::days(2));
        sink.write(b"first").unwrap();
        assert_eq!(files(&dir), ["slow.log"]);
        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "first");
    }

    #[test]
    fn close_is_idempotent_and_blocks_writes() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = sink(&dir, "error.log", &clock);
        sink.write(b"bye").unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(!sink.is_open());
        assert_eq!(sink.write(b"late"), Err(LogError::NotOpen(dir.path().join("error.log"))));
        assert_eq!(fs::read_to_string(dir.path().join("error.log")).unwrap(), "bye");
    }

    #[test]
    fn size_limit_rotates_with_sequence_names() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = RotatingFileSinkBuilder::new(dir.path().join("access.log"))
            .time_zone(TimeZone::UTC)
            .max_size(RotationSize::Bytes(8))
            .clock(clock.clone())
            .build()
            .unwrap();
        for chunk in ["aaaaaa", "bbbbbb", "cccccc"] {
            sink.write(chunk.as_bytes()).unwrap();
        }

        assert_eq!(
            files(&dir),
            ["access.log", "access.log-2025-04-01", "access.log-2025-04-01-1"]
        );
        assert_eq!(fs::read_to_string(dir.path().join("access.log-2025-04-01")).unwrap(), "aaaaaa");
        assert_eq!(fs::read_to_string(dir.path().join("access.log-2025-04-01-1")).unwrap(), "bbbbbb");
        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "cccccc");
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = Arc::new(sink(&dir, "access.log", &clock));

        let handles: Vec<_> = (0..8)
            .map(|writer| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for line in 0..200 {
                        sink.write(format!("writer-{writer} line-{line:03}\n").as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 8 * 200);
        for writer in 0..8 {
            let prefix = format!("writer-{writer} ");
            let own: Vec<_> = lines.iter().filter(|line| line.starts_with(&prefix)).collect();
            let expected: Vec<_> = (0..200).map(|line| format!("{prefix}line-{line:03}")).collect();
            assert_eq!(own.len(), 200);
            assert!(own.iter().zip(&expected).all(|(got, want)| **got == want));
        }
    }

    #[test]
    fn concurrent_writers_share_one_rotation_per_crossing() {
        let dir = TempDir::new().unwrap();
        let clock = clock();
        let sink = Arc::new(sink(&dir, "a.log", &clock));
        sink.write(b"yesterday\n").unwrap();
        clock.advance(Duration::days(1));

        let handles: Vec<_> = (0..16)
            .map(|writer| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for line in 0..50 {
                        sink.write(format!("writer-{writer} line-{line}\n").as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(files(&dir), ["a.log", "a.log-2025-04-01"]);
        assert_eq!(fs::read_to_string(dir.path().join("a.log-2025-04-01")).unwrap(), "yesterday\n");
        assert_eq!(fs::read_to_string(sink.path()).unwrap().lines().count(), 16 * 50);
    }

    #[test]
    fn builder_settings_reach_the_policy() {
        let dir = TempDir::new().unwrap();
        let sink = RotatingFileSinkBuilder::new(dir.path().join("stat.log"))
            .rotation(RotationAge::Hourly)
            .keep_days(2)
            .compression(Compression::Gzip)
            .clock(clock())
            .build()
            .unwrap();
        let policy = sink.policy();
        assert_eq!(policy.days_kept(), 2);
        assert_eq!(policy.compression_kind(), Some(Compression::Gzip));
        assert_eq!(policy.naming().granularity(), RotationAge::Hourly);
        assert!(!policy.is_noop());
    }

    #[test]
    fn stale_file_from_a_previous_run_rotates_under_its_own_period() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        fs::write(&path, "from last run\n").unwrap();
        let modified = DateTime::<Utc>::from(fs::metadata(&path).unwrap().modified().unwrap());

        let clock = Arc::new(ManualClock::new(modified + Duration::days(2)));
        let sink = sink(&dir, "access.log", &clock);
        sink.write(b"fresh\n").unwrap();

        let expected = format!("access.log-{}", modified.format("%Y-%m-%d"));
        assert_eq!(files(&dir), ["access.log".to_string(), expected.clone()]);
        assert_eq!(fs::read_to_string(dir.path().join(expected)).unwrap(), "from last run\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[test]
    fn works_as_an_io_writer() {
        use std::io::Write as _;

        let dir = TempDir::new().unwrap();
        let clock = clock();
        let mut sink = sink(&dir, "access.log", &clock);
        writeln!(sink, "formatted {}", 42).unwrap();
        sink.flush().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("access.log")).unwrap(), "formatted 42\n");
    }
}
