use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use getset::Getters;
use sanitize_filename::sanitize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Timestamp prefix of every backup description
pub static DESCRIPTION_TIME_FORMAT: &str = "%Y-%m-%d_%H:%M";

/// One directory to back up, fixed for the duration of a run.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct BackupSource {
    path: Arc<Path>,
    name: Arc<str>,
    timestamp: DateTime<Utc>,
}

impl BackupSource {
    pub fn new<P, N>(path: P, name: N, timestamp: DateTime<Utc>) -> Result<Self>
    where
        P: Into<PathBuf>,
        N: Into<Arc<str>>,
    {
        let path = path.into();
        if !path.is_absolute() {
            return Err(Error::ArchiveRead(format!(
                "source path {:?} is not absolute",
                path
            )));
        }
        if path.file_name().is_none() {
            return Err(Error::ArchiveRead(format!(
                "source path {:?} has no directory name",
                path
            )));
        }
        Ok(Self {
            path: path.into(),
            name: name.into(),
            timestamp,
        })
    }

    /// Uses the last path component as the logical name, resolving relative paths.
    pub fn from_dir<P: AsRef<Path>>(path: P, timestamp: DateTime<Utc>) -> Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                Error::ArchiveRead(format!("source path {:?} has no directory name", path))
            })?;
        Self::new(path, name, timestamp)
    }

    /// `"<timestamp> <name>"`, the human key of the archive record.
    pub fn description(&self) -> String {
        format!(
            "{} {}",
            self.timestamp.format(DESCRIPTION_TIME_FORMAT),
            self.name
        )
    }

    /// Description made safe to use as a file or object name.
    pub fn archive_base_name(&self) -> String {
        sanitize(self.description().replace(' ', "_"))
    }
}

/// Recovers the timestamp from a description written by [`BackupSource::description`].
pub fn timestamp_from_description(description: &str) -> Option<DateTime<Utc>> {
    let prefix = description.split_once(' ').map(|(p, _)| p).unwrap_or(description);
    NaiveDateTime::parse_from_str(prefix, DESCRIPTION_TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_year() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_description_format() {
        let source = BackupSource::new("/data/vm1", "vm1", new_year()).unwrap();
        assert_eq!(source.description(), "2024-01-01_00:00 vm1");
    }

    #[test]
    fn test_archive_base_name_is_sanitized() {
        let source = BackupSource::new("/data/vm1", "web/db: primary", new_year()).unwrap();
        let base = source.archive_base_name();
        assert!(!base.contains('/'));
        assert!(!base.contains(' '));
        assert!(base.starts_with("2024-01-01_00"));
    }

    #[test]
    fn test_relative_path_rejected() {
        assert!(BackupSource::new("data/vm1", "vm1", new_year()).is_err());
        assert!(BackupSource::new("/", "root", new_year()).is_err());
    }

    #[test]
    fn test_from_dir_uses_last_component() {
        let source = BackupSource::from_dir("/srv/vms/vm7", new_year()).unwrap();
        assert_eq!(source.name().as_ref(), "vm7");
        assert_eq!(source.path().as_ref(), Path::new("/srv/vms/vm7"));
    }

    #[test]
    fn test_timestamp_from_description() {
        assert_eq!(
            timestamp_from_description("2024-01-01_00:00 vm1"),
            Some(new_year())
        );
        assert_eq!(timestamp_from_description("manual upload"), None);
    }
}
