//! Backup retention: expiry and compression of rotated files.
//!
//! Retention never runs on the writing thread. Each sink owns a
//! [`RetentionWorker`] and hands it one job per rotation; the worker lists the
//! backups, classifies them and applies the result. Failures are logged and
//! left for the next pass.

use {
    crate::{naming::BackupNaming, set_permissions, LogError},
    chrono::{DateTime, Utc},
    flate2::write::GzEncoder,
    std::{
        fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
        sync::{
            mpsc::{self, SyncSender, TrySendError},
            Arc,
        },
        thread,
    },
    tracing::{debug, warn},
};

/// Pending passes a worker buffers before new requests are dropped. A dropped
/// request loses nothing: the next pass sees the same files.
const RETENTION_QUEUE_DEPTH: usize = 4;

/// Specifies the compression algorithm to use for rotated log files.
///
/// When a backup is compressed it keeps its name and gains the algorithm's
/// extension (e.g. `.gz` for Gzip). The uncompressed original is removed only
/// after the compressed copy is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Gzip compression, which provides a good balance of compression ratio
    /// and speed. Compressed files will have the `.gz` extension.
    #[default]
    Gzip,
    /// XZ compression. Higher ratio, slower. Compressed files will have the
    /// `.xz` extension.
    #[cfg(feature = "xz")]
    XZ,
}

impl Compression {
    /// Get the extension for the compressed log file.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            #[cfg(feature = "xz")]
            Compression::XZ => "xz",
        }
    }

    fn compress<R: io::BufRead, W: io::Write>(&self, reader: &mut R, writer: W) -> io::Result<()> {
        match self {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
                io::copy(reader, &mut encoder)?;
                encoder.finish()?.flush()
            }
            #[cfg(feature = "xz")]
            Compression::XZ => {
                let mut writer = writer;
                lzma_rs::xz_compress(reader, &mut writer)?;
                writer.flush()
            }
        }
    }
}

/// Counts from one retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub compressed: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// How long backups live and whether they are compressed.
///
/// One policy is shared read-only by every sink of a context.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    keep_days: u32,
    compression: Option<Compression>,
    naming: BackupNaming,
    file_mode: Option<u32>,
}

impl RetentionPolicy {
    /// Keep everything, compress nothing, default naming.
    pub fn new(naming: BackupNaming) -> Self {
        RetentionPolicy {
            naming,
            ..Default::default()
        }
    }

    /// Delete backups older than `keep_days` days. 0 keeps them forever.
    pub fn keep_days(self, keep_days: u32) -> Self {
        Self { keep_days, ..self }
    }

    pub fn compression(self, compression: Compression) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Permissions for log files and compressed backups (Unix-like systems
    /// only), in octal notation like `chmod`, e.g. `0o640`.
    pub fn file_mode(self, mode: u32) -> Self {
        Self {
            file_mode: Some(mode),
            ..self
        }
    }

    pub fn naming(&self) -> &BackupNaming {
        &self.naming
    }

    pub fn days_kept(&self) -> u32 {
        self.keep_days
    }

    pub fn compression_kind(&self) -> Option<Compression> {
        self.compression
    }

    pub(crate) fn mode(&self) -> Option<u32> {
        self.file_mode
    }

    /// Whether a pass could ever change anything.
    pub fn is_noop(&self) -> bool {
        self.keep_days == 0 && self.compression.is_none()
    }

    /// Run one retention pass over the backups of `base`, synchronously.
    ///
    /// Never fails: every error is logged and counted in the report.
    pub fn apply(&self, base: &Path, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport::default();
        let backups = match self.naming.list_backups(base) {
            Ok(backups) => backups,
            Err(err) => {
                warn!(path = %base.display(), %err, "failed to list log backups");
                report.failed += 1;
                return report;
            }
        };
        let classification =
            self.naming
                .classify(base, &backups, now, self.keep_days, self.compression.is_some());

        for path in &classification.to_delete {
            match fs::remove_file(path) {
                Ok(()) => report.deleted += 1,
                // Someone else got there first.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to remove expired log backup");
                    report.failed += 1;
                }
            }
        }

        if let Some(compression) = &self.compression {
            for path in &classification.to_compress {
                match self.compress_file(compression, path) {
                    Ok(()) => report.compressed += 1,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "failed to compress log backup");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Compress `log_path` into `<log_path>.<ext>` and remove the original.
    /// On failure the original stays and any partial output is removed.
    fn compress_file(&self, compression: &Compression, log_path: &Path) -> Result<(), LogError> {
        let compressed_path = PathBuf::from(format!("{}.{}", log_path.to_string_lossy(), compression.extension()));
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |err: io::Error| LogError::FileIOError {
                path,
                error: err.to_string(),
            }
        };

        let infile = fs::File::open(log_path).map_err(io_error(log_path))?;
        let mut reader = io::BufReader::new(infile);
        let outfile = fs::File::create(&compressed_path).map_err(io_error(&compressed_path))?;

        if let Err(err) = compression.compress(&mut reader, io::BufWriter::new(outfile)) {
            let _ = fs::remove_file(&compressed_path);
            return Err(io_error(&compressed_path)(err));
        }
        set_permissions(&compressed_path, self.file_mode)?;

        fs::remove_file(log_path).map_err(io_error(log_path))
    }
}

/// A detached thread that runs retention passes for one sink.
///
/// Dropping the worker closes its queue; the thread finishes the passes
/// already queued and exits.
pub(crate) struct RetentionWorker {
    sender: SyncSender<DateTime<Utc>>,
}

impl RetentionWorker {
    pub(crate) fn spawn(policy: Arc<RetentionPolicy>, base: PathBuf) -> Result<Self, LogError> {
        let (sender, receiver) = mpsc::sync_channel::<DateTime<Utc>>(RETENTION_QUEUE_DEPTH);
        let name = base
            .file_name()
            .map(|name| format!("{}-retention", name.to_string_lossy()))
            .unwrap_or_else(|| "log-retention".to_string());

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                for now in receiver {
                    let report = policy.apply(&base, now);
                    debug!(
                        path = %base.display(),
                        compressed = report.compressed,
                        deleted = report.deleted,
                        failed = report.failed,
                        "retention pass finished"
                    );
                }
            })
            .map_err(|err| LogError::InternalError(format!("failed to spawn retention worker: {err}")))?;

        Ok(RetentionWorker { sender })
    }

    /// Queue a pass evaluated at `now`. Never blocks.
    pub(crate) fn schedule(&self, now: DateTime<Utc>) {
        match self.sender.try_send(now) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("retention queue full, pass skipped"),
            Err(TrySendError::Disconnected(_)) => warn!("retention worker is gone, pass skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::naming::TimeZone,
        chrono::TimeZone as _,
        flate2::read::GzDecoder,
        std::{io::Read as _, time::Duration},
        tempfile::TempDir,
    };

    fn policy() -> RetentionPolicy {
        RetentionPolicy::new(BackupNaming::default().with_time_zone(TimeZone::UTC))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 8, 30, 0).unwrap()
    }

    #[test]
    fn apply_deletes_expired_and_compresses_the_rest() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("access.log");
        fs::write(&base, "active").unwrap();
        fs::write(dir.path().join("access.log-2025-04-01.gz"), "old").unwrap();
        fs::write(dir.path().join("access.log-2025-04-05"), "expired").unwrap();
        fs::write(dir.path().join("access.log-2025-04-09"), "recent backup\n").unwrap();

        let report = policy().keep_days(3).compression(Compression::Gzip).apply(&base, now());
        assert_eq!(report, RetentionReport { compressed: 1, deleted: 2, failed: 0 });

        assert!(!dir.path().join("access.log-2025-04-01.gz").exists());
        assert!(!dir.path().join("access.log-2025-04-05").exists());
        assert!(!dir.path().join("access.log-2025-04-09").exists());
        assert_eq!(fs::read_to_string(&base).unwrap(), "active");

        let mut decoded = String::new();
        GzDecoder::new(fs::File::open(dir.path().join("access.log-2025-04-09.gz")).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "recent backup\n");
    }

    #[test]
    fn backups_within_keep_days_survive() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("stat.log");
        for day in 7..=9 {
            fs::write(dir.path().join(format!("stat.log-2025-04-{day:02}")), "x").unwrap();
        }

        let report = policy().keep_days(3).apply(&base, now());
        assert_eq!(report.deleted, 0);
        assert_eq!(policy().naming().list_backups(&base).unwrap().len(), 3);
    }

    #[test]
    fn failed_compression_keeps_the_original() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("error.log");
        let backup = dir.path().join("error.log-2025-04-09");
        fs::write(&backup, "keep me").unwrap();
        // A directory squatting on the output name makes the create fail.
        fs::create_dir(dir.path().join("error.log-2025-04-09.gz")).unwrap();

        let report = policy().compression(Compression::Gzip).apply(&base, now());
        assert_eq!(report.failed, 1);
        assert_eq!(fs::read_to_string(&backup).unwrap(), "keep me");
    }

    #[test]
    fn noop_policy_is_detected() {
        assert!(policy().is_noop());
        assert!(!policy().keep_days(1).is_noop());
        assert!(!policy().compression(Compression::Gzip).is_noop());
    }

    #[test]
    fn worker_runs_scheduled_passes() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("slow.log");
        let backup = dir.path().join("slow.log-2025-04-09");
        fs::write(&backup, "slow").unwrap();

        let worker = RetentionWorker::spawn(Arc::new(policy().compression(Compression::Gzip)), base).unwrap();
        worker.schedule(now());
        drop(worker);

        let compressed = dir.path().join("slow.log-2025-04-09.gz");
        for _ in 0..200 {
            if compressed.exists() && !backup.exists() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("retention worker never compressed {}", backup.display());
    }
}
