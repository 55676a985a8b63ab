pub mod builtin;
pub mod size;
pub mod tar_command;

use crate::backup::archive::tar_command::TarCommandConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::pipeline::process::ProcessStage;
use crate::backup::pipeline::{Stage, TaskStage};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::source::BackupSource;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

/// How the source directory is turned into a tar stream
///
/// - Tar: the external `tar` executable, failure reported by its exit status
/// - Builtin: an in-process tar writer walking the directory in sorted order
#[derive(Clone, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "archiver_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum ArchiverConfig {
    Tar(TarCommandConfig),
    Builtin,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        ArchiverConfig::Tar(TarCommandConfig::default())
    }
}

impl Validate for ArchiverConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            ArchiverConfig::Tar(tar) => tar.validate(),
            ArchiverConfig::Builtin => Ok(()),
        }
    }
}

/// Builds the producer stage of a backup pipeline
pub trait ArchiveStageBuilder {
    fn build_archive_stage(&self, source: &BackupSource) -> Result<Stage>;
}

impl ArchiveStageBuilder for ArchiverConfig {
    fn build_archive_stage(&self, source: &BackupSource) -> Result<Stage> {
        match self {
            ArchiverConfig::Tar(tar) => {
                tracing::info!("Archiving {:?} with {:?}", source.path(), tar.executable());
                let command = tar.command(source.path())?;
                Ok(ProcessStage::new("tar", command, |failure| {
                    Error::ArchiveRead(failure.to_string())
                })
                .into())
            }
            ArchiverConfig::Builtin => {
                tracing::info!("Archiving {:?} with builtin tar writer", source.path());
                let dir = source.path().clone();
                Ok(TaskStage::new("archive", move |_, output| {
                    builtin::write_archive(&dir, output).map(|_| ())
                })
                .into())
            }
        }
        .with_debug_object_and_fn_name(self.clone(), "build_archive_stage")
    }
}

static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for ArchiverConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(TAR_FILE_EXT.get_or_init(|| "tar".into()).clone())
    }
}

/// Splits a source directory into the directory to run in and the entry to archive.
pub(crate) fn split_source(source_dir: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    match (source_dir.parent(), source_dir.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(Error::ArchiveRead(format!(
            "cannot archive {:?}, it has no parent directory",
            source_dir
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_default_is_tar_command() {
        assert!(matches!(ArchiverConfig::default(), ArchiverConfig::Tar(_)));
    }

    #[test]
    fn test_archiver_config_deserialization() {
        let builtin: ArchiverConfig = serde_yml::from_str("archiver_type: builtin").unwrap();
        assert_eq!(builtin, ArchiverConfig::Builtin);

        let tar: ArchiverConfig =
            serde_yml::from_str("archiver_type: tar\nexecutable: /usr/local/bin/gtar").unwrap();
        match tar {
            ArchiverConfig::Tar(c) => assert_eq!(c.executable(), Path::new("/usr/local/bin/gtar")),
            _ => panic!("Expected tar archiver"),
        }
    }

    #[test]
    fn test_build_stage_names() {
        let source = BackupSource::new("/data/vm1", "vm1", Utc::now()).unwrap();
        let tar = ArchiverConfig::default().build_archive_stage(&source).unwrap();
        assert_eq!(tar.name(), "tar");
        let builtin = ArchiverConfig::Builtin.build_archive_stage(&source).unwrap();
        assert_eq!(builtin.name(), "archive");
    }

    #[test]
    fn test_split_source() {
        let (parent, name) = split_source(Path::new("/data/vm1")).unwrap();
        assert_eq!(parent, Path::new("/data"));
        assert_eq!(name, "vm1");
        assert!(split_source(Path::new("/")).is_err());
    }

    #[test]
    fn test_file_ext() {
        assert_eq!(ArchiverConfig::Builtin.file_ext().unwrap().as_ref(), "tar");
    }
}
