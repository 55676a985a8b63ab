use crate::backup::pipeline::process::{ProcessStage, StageFailure};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::secret::SecretHandle;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::process::Command;
use validator::Validate;

/// Cipher used for every archive. Not configurable.
pub static CIPHER_ALGO: &str = "AES256";

fn default_gpg() -> PathBuf {
    PathBuf::from("gpg")
}

/// Configuration for symmetric encryption with GnuPG
///
/// Compression is always disabled: the input is a tar stream, compressing
/// it before encryption would leak size information for no real gain.
/// The passphrase is delivered through a [`SecretHandle`], never as an
/// argument.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct GpgEncryptorConfig {
    #[serde(default = "default_gpg")]
    #[builder(default = default_gpg(), into)]
    executable: PathBuf,
    #[validate(nested)]
    #[builder(into)]
    passphrase: RedactedString,
    /// Alternative GnuPG home directory
    #[builder(into)]
    homedir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl GpgEncryptorConfig {
    /// `gpg` command encrypting stdin to stdout, reading the passphrase from `secret_path`.
    pub fn encrypt_command(&self, secret_path: &Path) -> Command {
        self.command(Direction::Encrypt, secret_path)
    }

    /// `gpg` command decrypting stdin to stdout, reading the passphrase from `secret_path`.
    pub fn decrypt_command(&self, secret_path: &Path) -> Command {
        self.command(Direction::Decrypt, secret_path)
    }

    fn command(&self, direction: Direction, secret_path: &Path) -> Command {
        let mut command = Command::new(&self.executable);
        if let Some(homedir) = &self.homedir {
            command.arg("--homedir").arg(homedir);
        }
        command.args([
            "--batch",
            "--no-tty",
            "--pinentry-mode",
            "loopback",
            "--no-symkey-cache",
        ]);
        match direction {
            Direction::Encrypt => command.args([
                "--symmetric",
                "--compress-algo",
                "none",
                "--cipher-algo",
                CIPHER_ALGO,
            ]),
            Direction::Decrypt => command.arg("--decrypt"),
        };
        command
            .arg("--passphrase-file")
            .arg(secret_path)
            .arg("--output")
            .arg("-");
        command
    }

    /// Stage running `gpg` in `direction`, keeping the passphrase pipe open until gpg exits.
    pub fn stage(&self, direction: Direction) -> Result<ProcessStage> {
        let secret = SecretHandle::acquire(&self.passphrase)?;
        Ok(self.process_stage(direction, secret.path()).holding(secret))
    }

    fn process_stage(&self, direction: Direction, secret_path: &Path) -> ProcessStage {
        let command = self.command(direction, secret_path);
        let secret_path = secret_path.to_string_lossy().to_string();
        let name = match direction {
            Direction::Encrypt => "gpg-encrypt",
            Direction::Decrypt => "gpg-decrypt",
        };
        ProcessStage::new(name, command, move |failure| {
            classify_failure(&secret_path, failure)
        })
    }
}

/// A failure mentioning the descriptor path means the passphrase never arrived.
fn classify_failure(secret_path: &str, failure: StageFailure) -> Error {
    if failure.stderr.contains(secret_path) {
        Error::SecretDelivery(failure.to_string())
    } else {
        Error::Encryption(failure.to_string())
    }
}
