//! Passphrase handoff to a child process through an anonymous pipe.
//!
//! The passphrase is written into a pipe whose write end is closed right away.
//! The read end stays open in this process and is named through procfs
//! (`/proc/<pid>/fd/<n>`), so a child can open it like a file without the
//! secret ever touching the filesystem or an argument vector.

use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::fmt::{Debug, Formatter};
use std::io::PipeReader;
use std::path::{Path, PathBuf};

/// Largest secret (newline included) that fits in one atomic pipe write.
pub const MAX_SECRET_LEN: usize = 4096;

/// Open read end of a secret pipe. Dropping it closes the descriptor.
pub struct SecretHandle {
    reader: PipeReader,
    path: PathBuf,
}

impl SecretHandle {
    /// Writes `secret` into a fresh pipe and returns the handle naming its read end.
    pub fn acquire(secret: &RedactedString) -> Result<SecretHandle> {
        if secret.as_bytes().len() + 1 > MAX_SECRET_LEN {
            return Err(Error::SecretDelivery(format!(
                "secret longer than {} bytes",
                MAX_SECRET_LEN - 1
            )));
        }
        if secret.as_bytes().contains(&b'\n') {
            return Err(Error::SecretDelivery(
                "secret must be a single line".to_string(),
            ));
        }

        let (reader, writer) = std::io::pipe()
            .map_err(|e| Error::SecretDelivery(format!("cannot create pipe: {e}")))?;
        write_and_close(writer, secret)?;

        let path = descriptor_path(&reader)?;
        std::fs::metadata(&path).map_err(|e| {
            Error::SecretDelivery(format!("descriptor path {:?} not accessible: {e}", path))
        })?;

        tracing::debug!("Secret pipe ready at {:?}", path);
        Ok(SecretHandle { reader, path })
    }

    /// File-path-shaped name of the read end, valid while the handle is alive.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Debug for SecretHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretHandle")
            .field("reader", &self.reader)
            .field("path", &self.path)
            .finish()
    }
}

fn write_and_close(mut writer: std::io::PipeWriter, secret: &RedactedString) -> Result<()> {
    use std::io::Write;
    writer
        .write_all(secret.as_bytes())
        .and_then(|_| writer.write_all(b"\n"))
        .map_err(|e| Error::SecretDelivery(format!("cannot write secret pipe: {e}")))
    // writer dropped here, the reader sees EOF after the secret
}

#[cfg(target_os = "linux")]
fn descriptor_path(reader: &PipeReader) -> Result<PathBuf> {
    use std::os::fd::AsRawFd;
    Ok(PathBuf::from(format!(
        "/proc/{}/fd/{}",
        std::process::id(),
        reader.as_raw_fd()
    )))
}

#[cfg(not(target_os = "linux"))]
fn descriptor_path(_reader: &PipeReader) -> Result<PathBuf> {
    Err(Error::SecretDelivery(
        "passing secrets through a descriptor path requires procfs".to_string(),
    ))
}
