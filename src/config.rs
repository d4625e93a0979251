//! Configuration consumed by [`LogContext::set_up`](crate::LogContext::set_up).
//!
//! Field names follow the camelCase convention of the configuration files this
//! is usually embedded in. Every field has a default, so an empty document is a
//! valid file-mode configuration writing to `./logs`.

use {
    crate::{
        naming::{RotationAge, TimeZone},
        sink::RotationSize,
    },
    serde::Deserialize,
    std::{path::PathBuf, time::Duration},
};

/// Where logs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    /// Standard output and error. No files, no rotation.
    Console,
    /// Files directly under [`Config::path`].
    #[default]
    File,
    /// Files under `path/namespace/hostname`, for shared volumes where many
    /// hosts log side by side.
    #[serde(alias = "var")]
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub mode: LogMode,
    pub path: PathBuf,
    /// Required in volume mode.
    pub namespace: String,
    /// Delete backups older than this many days. 0 keeps them forever.
    pub keep_days: u32,
    /// Gzip rotated files.
    pub compress: bool,
    /// Minimum spacing between stack-trace writes. 0 disables suppression.
    pub stack_cooldown_millis: u64,
    pub rotation: RotationAge,
    pub time_zone: TimeZone,
    /// Also rotate when an active file would grow past this many bytes.
    pub max_size: Option<u64>,
    /// Unix permission bits for log files, e.g. `0o640`.
    pub file_mode: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: LogMode::File,
            path: PathBuf::from("logs"),
            namespace: String::new(),
            keep_days: 0,
            compress: false,
            stack_cooldown_millis: 0,
            rotation: RotationAge::Daily,
            time_zone: TimeZone::Local,
            max_size: None,
            file_mode: None,
        }
    }
}

impl Config {
    pub fn console() -> Self {
        Config {
            mode: LogMode::Console,
            ..Default::default()
        }
    }

    /// File mode rooted at `path`.
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Config {
            mode: LogMode::File,
            path: path.into(),
            ..Default::default()
        }
    }

    /// Volume mode: logs land in `path/namespace/<hostname>`.
    pub fn volume<P: Into<PathBuf>, S: Into<String>>(path: P, namespace: S) -> Self {
        Config {
            mode: LogMode::Volume,
            path: path.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_keep_days(self, keep_days: u32) -> Self {
        Self { keep_days, ..self }
    }

    pub fn with_compress(self, compress: bool) -> Self {
        Self { compress, ..self }
    }

    pub fn with_stack_cooldown_millis(self, stack_cooldown_millis: u64) -> Self {
        Self {
            stack_cooldown_millis,
            ..self
        }
    }

    pub fn with_rotation(self, rotation: RotationAge) -> Self {
        Self { rotation, ..self }
    }

    pub fn with_time_zone(self, time_zone: TimeZone) -> Self {
        Self { time_zone, ..self }
    }

    pub fn with_max_size(self, max_size: RotationSize) -> Self {
        Self {
            max_size: Some(max_size.bytes()),
            ..self
        }
    }

    pub fn with_file_mode(self, file_mode: u32) -> Self {
        Self {
            file_mode: Some(file_mode),
            ..self
        }
    }

    pub fn stack_cooldown(&self) -> Duration {
        Duration::from_millis(self.stack_cooldown_millis)
    }
}
