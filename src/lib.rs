//! # LogKeeper
//!
//! LogKeeper persists categorized log streams (access, error, slow, stat and
//! stack traces) to files that roll over when the wall-clock period changes.
//! Rotated files are renamed with a sortable timestamp, optionally
//! compressed, and deleted once they are older than the configured number of
//! days. Stack-trace output is rate-limited so a panic firing on every request
//! cannot flood the disk. **Retention work runs on a background thread per
//! sink, so rotation never makes a writer wait for compression.**
//!
//! A [`LogContext`] is the entry point. It is set up once from a [`Config`],
//! falls back to the console until then, and closes every sink on shutdown.
//!
//! ## Example
//!
//! ```rust
//! use logkeeper::{Category, Config, LogContext};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = tempfile::tempdir()?;
//!     let context = LogContext::new();
//!     context.set_up(
//!         &Config::file(dir.path())
//!             .with_keep_days(7) // Delete backups older than a week
//!             .with_compress(true) // Gzip rotated files
//!             .with_stack_cooldown_millis(100),
//!     )?;
//!
//!     context.write(Category::Access, b"GET /healthz 200\n")?;
//!     context.emit_suppressed(b"panic: index out of bounds\n");
//!
//!     context.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! A single [`RotatingFileSink`] can also be used on its own, for example as a
//! `tracing` writer:
//!
//! ```rust
//! use {
//!     logkeeper::{RotatingFileSinkBuilder, RotationAge},
//!     std::sync::Arc,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = tempfile::tempdir()?;
//!     let sink = RotatingFileSinkBuilder::new(dir.path().join("tracing.log"))
//!         .rotation(RotationAge::Hourly)
//!         .keep_days(3)
//!         .build()?;
//!     let subscriber = tracing_subscriber::fmt()
//!         .with_writer(Arc::new(sink))
//!         .with_ansi(false)
//!         .finish();
//!     tracing::subscriber::with_default(subscriber, || tracing::info!("hello"));
//!     Ok(())
//! }
//! ```
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::{fs, fs::Permissions, os::unix::fs::PermissionsExt};

mod clock;
mod config;
mod console;
mod dedup;
mod lifecycle;
mod naming;
mod retention;
mod sink;

pub use {
    clock::{Clock, ManualClock, SystemClock},
    config::{Config, LogMode},
    console::{ConsoleSink, ConsoleStream},
    dedup::DeduplicatingLogger,
    lifecycle::{volume_directory, Category, LogContext, DEFAULT_HOST_NAME},
    naming::{Backup, BackupNaming, Classification, RotationAge, TimeZone, DEFAULT_DELIMITER},
    retention::{Compression, RetentionPolicy, RetentionReport},
    sink::{LogSink, RotatingFileSink, RotatingFileSinkBuilder, RotationSize},
};

/// Errors that can occur when setting up or writing logs.
///
/// Underlying I/O errors are kept as messages so one outcome can be handed to
/// every caller of [`LogContext::set_up`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("log path must be set")]
    PathNotSet,
    #[error("log namespace must be set")]
    NamespaceNotSet,
    #[error("log file '{0}' is not open")]
    NotOpen(PathBuf),
    #[error("Failed to create directory '{0}': {1}")]
    CreateDirectoryFailed(PathBuf, String),
    #[error("Failed to create file '{0}': {1}")]
    CreateFileFailed(PathBuf, String),
    #[error("Failed to rename file from '{from}' to '{to}': {error}")]
    RenameFileError { from: PathBuf, to: PathBuf, error: String },
    #[error("File IO error on '{path}': {error}")]
    FileIOError { path: PathBuf, error: String },
    #[error("Failed to set file permissions for '{path}': {error}")]
    SetFilePermissionsError { path: PathBuf, error: String },
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Set the permissions for a file based on the configured file mode.
///
/// Only has an effect when a mode is configured and the target is a Unix-like
/// system. Elsewhere a warning is logged and nothing changes, as the Unix
/// permission model doesn't apply.
pub(crate) fn set_permissions(path: &Path, mode: Option<u32>) -> Result<(), LogError> {
    if let Some(mode) = mode {
        #[cfg(unix)]
        {
            fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|err| {
                LogError::SetFilePermissionsError {
                    path: path.to_path_buf(),
                    error: err.to_string(),
                }
            })?
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            tracing::warn!(path = %path.display(), "setting file permissions is not supported on this platform");
        }
    }
    Ok(())
}
