use crate::backup::archive::split_source;
use crate::backup::result_error::result::Result;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use validator::Validate;

fn default_tar() -> PathBuf {
    PathBuf::from("tar")
}

/// Configuration for archiving with an external `tar` executable
///
/// The command line is always built as a typed argument vector:
/// `tar -c -f - -C <parent> -- <dir name>`, so paths are never re-parsed
/// by a shell.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct TarCommandConfig {
    /// Executable name or path, `tar` by default
    #[serde(default = "default_tar")]
    #[builder(default = default_tar(), into)]
    executable: PathBuf,
}

impl Default for TarCommandConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TarCommandConfig {
    /// Command writing the archive of `source_dir` to stdout.
    pub fn command(&self, source_dir: &Path) -> Result<Command> {
        let (parent, name) = split_source(source_dir)?;
        let mut command = Command::new(&self.executable);
        command
            .arg("-c")
            .arg("-f")
            .arg("-")
            .arg("-C")
            .arg(parent)
            .arg("--")
            .arg(name);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::pipeline::process::ProcessStage;
    use crate::backup::pipeline::{Pipeline, Sink, StreamReader};
    use crate::backup::result_error::error::Error;
    use std::ffi::OsStr;
    use std::io::Read;
    use tempfile::TempDir;

    struct VecSink(Vec<u8>);

    impl Sink for VecSink {
        type Output = Vec<u8>;

        fn consume(&mut self, input: &mut StreamReader) -> Result<()> {
            input.read_to_end(&mut self.0)?;
            Ok(())
        }

        fn commit(self) -> Result<Vec<u8>> {
            Ok(self.0)
        }

        fn abandon(self) {}
    }

    #[test]
    fn test_command_arguments_are_typed() {
        let config = TarCommandConfig::default();
        let command = config
            .command(Path::new("/data/my vm; rm -rf ~"))
            .unwrap();

        assert_eq!(command.get_program(), OsStr::new("tar"));
        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(
            args,
            vec!["-c", "-f", "-", "-C", "/data", "--", "my vm; rm -rf ~"]
        );
    }

    #[test]
    fn test_custom_executable() {
        let config = TarCommandConfig::builder().executable("/opt/bin/gtar").build();
        let command = config.command(Path::new("/data/vm1")).unwrap();
        assert_eq!(command.get_program(), OsStr::new("/opt/bin/gtar"));
    }

    #[test]
    fn test_tar_round_trip() {
        if which::which("tar").is_err() {
            eprintln!("tar not installed, skipping");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("vm1");
        std::fs::create_dir_all(src.join("disks")).unwrap();
        std::fs::write(src.join("vm1.vbox"), "<VirtualBox/>").unwrap();
        std::fs::write(src.join("disks/disk.vdi"), vec![7u8; 100_000]).unwrap();

        let command = TarCommandConfig::default().command(&src).unwrap();
        let stage = ProcessStage::new("tar", command, |f| Error::ArchiveRead(f.to_string()));
        let bytes = Pipeline::new(stage).run(VecSink(Vec::new())).unwrap();

        let out = TempDir::new().unwrap();
        tar::Archive::new(bytes.as_slice()).unpack(out.path()).unwrap();
        assert_eq!(
            std::fs::read(out.path().join("vm1/vm1.vbox")).unwrap(),
            b"<VirtualBox/>"
        );
        assert_eq!(
            std::fs::read(out.path().join("vm1/disks/disk.vdi")).unwrap(),
            vec![7u8; 100_000]
        );
    }

    #[test]
    fn test_tar_missing_directory_is_archive_read_error() {
        if which::which("tar").is_err() {
            eprintln!("tar not installed, skipping");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let command = TarCommandConfig::default()
            .command(&temp_dir.path().join("missing"))
            .unwrap();
        let stage = ProcessStage::new("tar", command, |f| Error::ArchiveRead(f.to_string()));

        let err = Pipeline::new(stage).run(VecSink(Vec::new())).unwrap_err();
        assert!(matches!(err.primary(), Error::ArchiveRead(_)));
    }
}
