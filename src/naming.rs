//! Backup file naming and retention classification.
//!
//! A backup of `access.log` rotated out of the 2025-04-01 period is named
//! `access.log-2025-04-01`. If that name is taken (two rotations inside one
//! period), a sequence is appended: `access.log-2025-04-01-1`,
//! `access.log-2025-04-01-2`, and so on. Compressed backups keep their name
//! and gain an extension: `access.log-2025-04-01.gz`.

use {
    crate::LogError,
    chrono::{
        DateTime, Duration, FixedOffset, Local, NaiveDateTime, NaiveTime, TimeZone as _, Timelike,
        Utc,
    },
    regex::Regex,
    serde::Deserialize,
    std::{
        fs, io,
        path::{Path, PathBuf},
    },
};

/// Extensions a compressed backup may carry, whichever codecs are compiled in.
const COMPRESSED_EXTENSIONS: [&str; 2] = ["gz", "xz"];

/// The default separator between the base file name and the period.
pub const DEFAULT_DELIMITER: &str = "-";

/// Specifies how long one rotation period lasts.
///
/// This determines the granularity of log file splitting, affecting:
/// - When the active file is rolled over
/// - The timestamp format in backup file names
/// - How backup ages are measured for retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationAge {
    /// A new period every minute. Backups look like `app.log-2025-04-01-19-55`.
    Minutely,
    /// A new period every hour. Backups look like `app.log-2025-04-01-19`.
    Hourly,
    /// A new period every day at midnight in the configured time zone.
    /// Backups look like `app.log-2025-04-01`.
    #[default]
    Daily,
}

impl RotationAge {
    fn format(&self) -> &'static str {
        match self {
            RotationAge::Minutely => "%Y-%m-%d-%H-%M",
            RotationAge::Hourly => "%Y-%m-%d-%H",
            RotationAge::Daily => "%Y-%m-%d",
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            RotationAge::Minutely => r"\d{4}-\d{2}-\d{2}-\d{2}-\d{2}",
            RotationAge::Hourly => r"\d{4}-\d{2}-\d{2}-\d{2}",
            RotationAge::Daily => r"\d{4}-\d{2}-\d{2}",
        }
    }

    /// Length of one period.
    pub fn length(&self) -> Duration {
        match self {
            RotationAge::Minutely => Duration::minutes(1),
            RotationAge::Hourly => Duration::hours(1),
            RotationAge::Daily => Duration::days(1),
        }
    }

    /// Truncate `datetime` to the start of its period.
    fn truncate(&self, datetime: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        let time = match self {
            RotationAge::Minutely => NaiveTime::from_hms_opt(datetime.hour(), datetime.minute(), 0),
            RotationAge::Hourly => NaiveTime::from_hms_opt(datetime.hour(), 0, 0),
            RotationAge::Daily => NaiveTime::from_hms_opt(0, 0, 0),
        };
        time.and_then(|time| {
            datetime
                .offset()
                .from_local_datetime(&datetime.date_naive().and_time(time))
                .single()
        })
        .unwrap_or(datetime)
    }

    /// Parse a timestamp written by [`RotationAge::format`].
    fn parse(&self, timestamp: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
        // Pad to minute precision so a single full format parses every granularity.
        let padded = match self {
            RotationAge::Minutely => timestamp.to_string(),
            RotationAge::Hourly => format!("{timestamp}-00"),
            RotationAge::Daily => format!("{timestamp}-00-00"),
        };
        let naive = NaiveDateTime::parse_from_str(&padded, RotationAge::Minutely.format()).ok()?;
        offset.from_local_datetime(&naive).single()
    }
}

/// Specifies the time zone periods are evaluated in.
///
/// # Examples
/// ```
/// use {chrono::FixedOffset, logkeeper::TimeZone};
///
/// let utc = TimeZone::UTC;
/// let local = TimeZone::Local;
/// let china = TimeZone::Fix(FixedOffset::east_opt(8 * 3600).unwrap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeZone {
    /// Use UTC. Best for fleets spread across regions.
    UTC,
    /// Use the system's local offset, captured when the naming is built.
    ///
    /// The offset is not refreshed afterwards, so across a daylight-saving
    /// change period boundaries sit an hour off until the process restarts.
    /// Use `Fix` or `UTC` where that matters.
    #[default]
    Local,
    /// Use a fixed offset regardless of where the process runs.
    #[serde(skip)]
    Fix(FixedOffset),
}

impl TimeZone {
    fn offset(&self) -> FixedOffset {
        match self {
            TimeZone::UTC => Utc::now().fixed_offset().offset().to_owned(),
            TimeZone::Local => Local::now().offset().to_owned(),
            TimeZone::Fix(fixed_offset) => *fixed_offset,
        }
    }
}

/// A rotated file found next to its base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub path: PathBuf,
    /// Start of the period the backup was written in.
    pub period: DateTime<FixedOffset>,
    /// 0 for the first backup of a period.
    pub sequence: u32,
    pub compressed: bool,
}

/// What a retention pass should do with the existing backups.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Classification {
    pub to_compress: Vec<PathBuf>,
    pub to_delete: Vec<PathBuf>,
}

/// Computes backup names and classifies existing backups.
#[derive(Debug, Clone)]
pub struct BackupNaming {
    delimiter: String,
    granularity: RotationAge,
    offset: FixedOffset,
}

impl Default for BackupNaming {
    fn default() -> Self {
        BackupNaming::new(DEFAULT_DELIMITER)
    }
}

impl BackupNaming {
    /// Daily periods in the local time zone.
    pub fn new<S: Into<String>>(delimiter: S) -> Self {
        BackupNaming {
            delimiter: delimiter.into(),
            granularity: RotationAge::Daily,
            offset: TimeZone::Local.offset(),
        }
    }

    pub fn with_delimiter<S: Into<String>>(self, delimiter: S) -> Self {
        Self {
            delimiter: delimiter.into(),
            ..self
        }
    }

    pub fn with_granularity(self, granularity: RotationAge) -> Self {
        Self { granularity, ..self }
    }

    pub fn with_time_zone(self, time_zone: TimeZone) -> Self {
        Self {
            offset: time_zone.offset(),
            ..self
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn granularity(&self) -> RotationAge {
        self.granularity
    }

    /// Start of the period containing `instant`.
    pub fn period_start(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        self.granularity.truncate(instant.with_timezone(&self.offset))
    }

    /// The sortable timestamp used in backup names for `instant`'s period.
    pub fn timestamp(&self, instant: DateTime<Utc>) -> String {
        self.period_start(instant).format(self.granularity.format()).to_string()
    }

    /// Name for a backup of `base` holding the period that contains `instant`.
    ///
    /// Existing plain or compressed backups with the same name are skipped by
    /// appending an increasing sequence number.
    pub fn name_for(&self, base: &Path, instant: DateTime<Utc>) -> PathBuf {
        let stem = format!("{}{}{}", base.to_string_lossy(), self.delimiter, self.timestamp(instant));
        let mut candidate = PathBuf::from(&stem);
        let mut sequence = 0u32;
        while Self::taken(&candidate) || candidate == base {
            sequence += 1;
            candidate = PathBuf::from(format!("{stem}{}{sequence}", self.delimiter));
        }
        candidate
    }

    fn taken(candidate: &Path) -> bool {
        candidate.exists()
            || COMPRESSED_EXTENSIONS
                .iter()
                .any(|ext| PathBuf::from(format!("{}.{ext}", candidate.to_string_lossy())).exists())
    }

    fn backup_pattern(&self, filename: &str) -> Result<Regex, LogError> {
        let delimiter = regex::escape(&self.delimiter);
        Regex::new(&format!(
            r"^{}{delimiter}(?P<ts>{})(?:{delimiter}(?P<seq>\d+))?(?:\.(?P<ext>{}))?$",
            regex::escape(filename),
            self.granularity.pattern(),
            COMPRESSED_EXTENSIONS.join("|"),
        ))
        .map_err(|err| LogError::InternalError(err.to_string()))
    }

    /// List the backups of `base` that live in its directory, oldest first.
    pub fn list_backups(&self, base: &Path) -> Result<Vec<Backup>, LogError> {
        let filename = match base.file_name().and_then(|name| name.to_str()) {
            Some(filename) => filename,
            None => return Ok(Vec::new()),
        };
        let directory = match base.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let pattern = self.backup_pattern(filename)?;

        let files = match fs::read_dir(&directory) {
            Ok(files) => files,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(LogError::FileIOError {
                    path: directory,
                    error: err.to_string(),
                })
            }
        };

        let mut backups = Vec::new();
        for file in files.flatten() {
            if !file.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = file.file_name();
            let Some(captures) = name.to_str().and_then(|name| pattern.captures(name)) else {
                continue;
            };
            let Some(period) = self.granularity.parse(&captures["ts"], self.offset) else {
                continue;
            };
            backups.push(Backup {
                path: file.path(),
                period,
                sequence: captures
                    .name("seq")
                    .and_then(|seq| seq.as_str().parse().ok())
                    .unwrap_or(0),
                compressed: captures.name("ext").is_some(),
            });
        }

        backups.sort_by(|a, b| (a.period, a.sequence).cmp(&(b.period, b.sequence)));
        Ok(backups)
    }

    /// Decide which backups to delete and which to compress.
    ///
    /// A backup's age is measured from the end of its period, the moment it
    /// was rotated out. `keep_days == 0` keeps everything.
    pub fn classify(
        &self,
        active: &Path,
        backups: &[Backup],
        now: DateTime<Utc>,
        keep_days: u32,
        compress: bool,
    ) -> Classification {
        let mut classification = Classification::default();
        let max_age = Duration::days(i64::from(keep_days));
        for backup in backups.iter().filter(|backup| backup.path != active) {
            let rotated_at = backup.period + self.granularity.length();
            if keep_days > 0 && now.signed_duration_since(rotated_at) > max_age {
                classification.to_delete.push(backup.path.clone());
            } else if compress && !backup.compressed {
                classification.to_compress.push(backup.path.clone());
            }
        }
        classification
    }
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone as _, tempfile::TempDir};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn naming() -> BackupNaming {
        BackupNaming::default().with_time_zone(TimeZone::UTC)
    }

    #[test]
    fn names_use_period_granularity() {
        let base = Path::new("/var/log/app/access.log");
        let at = utc(2025, 4, 1, 19, 55);
        assert_eq!(
            naming().name_for(base, at),
            PathBuf::from("/var/log/app/access.log-2025-04-01")
        );
        assert_eq!(
            naming().with_granularity(RotationAge::Hourly).name_for(base, at),
            PathBuf::from("/var/log/app/access.log-2025-04-01-19")
        );
        assert_eq!(
            naming().with_granularity(RotationAge::Minutely).name_for(base, at),
            PathBuf::from("/var/log/app/access.log-2025-04-01-19-55")
        );
    }

    #[test]
    fn fixed_offset_shifts_the_period() {
        let naming = BackupNaming::new("-").with_time_zone(TimeZone::Fix(FixedOffset::east_opt(8 * 3600).unwrap()));
        // 20:00 UTC is already the next day at UTC+8.
        assert_eq!(naming.timestamp(utc(2025, 4, 1, 20, 0)), "2025-04-02");
    }

    #[test]
    fn same_period_rotations_get_distinct_names() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("error.log");
        let at = utc(2025, 4, 1, 10, 0);

        let first = naming().name_for(&base, at);
        fs::write(&first, "first").unwrap();
        let second = naming().name_for(&base, at);
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("error.log-2025-04-01-1"));

        fs::write(&second, "second").unwrap();
        let third = naming().name_for(&base, at);
        assert!(third.to_string_lossy().ends_with("error.log-2025-04-01-2"));
    }

    #[test]
    fn compressed_backup_also_blocks_the_name() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("stat.log");
        let at = utc(2025, 4, 1, 10, 0);
        fs::write(dir.path().join("stat.log-2025-04-01.gz"), "x").unwrap();

        let name = naming().name_for(&base, at);
        assert_eq!(name, dir.path().join("stat.log-2025-04-01-1"));
    }

    #[test]
    fn list_backups_ignores_unrelated_files() {
        let dir = TempDir::new().unwrap();
        for name in [
            "access.log",
            "access.log-2025-04-01.gz",
            "access.log-2025-04-02",
            "access.log-2025-04-02-1",
            "access.log-notadate",
            "error.log-2025-04-01",
        ] {
            fs::write(dir.path().join(name), name).unwrap();
        }

        let backups = naming().list_backups(&dir.path().join("access.log")).unwrap();
        let names: Vec<_> = backups
            .iter()
            .map(|b| b.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            ["access.log-2025-04-01.gz", "access.log-2025-04-02", "access.log-2025-04-02-1"]
        );
        assert!(backups[0].compressed);
        assert_eq!(backups[2].sequence, 1);
    }

    #[test]
    fn list_backups_of_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("nope").join("access.log");
        assert!(naming().list_backups(&base).unwrap().is_empty());
    }

    #[test]
    fn classify_deletes_only_expired_backups() {
        let naming = naming();
        let offset = FixedOffset::east_opt(0).unwrap();
        let backup = |day: u32| Backup {
            path: PathBuf::from(format!("access.log-2025-04-{day:02}")),
            period: offset.with_ymd_and_hms(2025, 4, day, 0, 0, 0).unwrap(),
            sequence: 0,
            compressed: false,
        };
        let backups = [backup(1), backup(2), backup(4)];
        let now = utc(2025, 4, 5, 10, 0);

        let result = naming.classify(Path::new("access.log"), &backups, now, 3, false);
        assert_eq!(result.to_delete, [PathBuf::from("access.log-2025-04-01")]);
        assert!(result.to_compress.is_empty());

        let result = naming.classify(Path::new("access.log"), &backups, now, 0, false);
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn classify_compresses_survivors_once() {
        let naming = naming();
        let offset = FixedOffset::east_opt(0).unwrap();
        let backups = [
            Backup {
                path: PathBuf::from("slow.log-2025-04-03.gz"),
                period: offset.with_ymd_and_hms(2025, 4, 3, 0, 0, 0).unwrap(),
                sequence: 0,
                compressed: true,
            },
            Backup {
                path: PathBuf::from("slow.log-2025-04-04"),
                period: offset.with_ymd_and_hms(2025, 4, 4, 0, 0, 0).unwrap(),
                sequence: 0,
                compressed: false,
            },
        ];
        let result = naming.classify(Path::new("slow.log"), &backups, utc(2025, 4, 5, 1, 0), 7, true);
        assert_eq!(result.to_compress, [PathBuf::from("slow.log-2025-04-04")]);
        assert!(result.to_delete.is_empty());
    }
}
