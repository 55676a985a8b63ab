//! A directory used as an archive vault.
//!
//! Archives are content addressed: the file name, and the remote id, is
//! the SHA-256 hex digest of the uploaded bytes. A `<id>.json` sidecar keeps
//! the description and size.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::{MultipartUpload, RemoteId, RemoteStore, UploadDescriptor};
use crate::backup::validate::validate_writable_dir;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use validator::Validate;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct LocalVaultConfig {
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    path: PathBuf,
}

/// Sidecar stored next to every archive
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultEntry {
    pub description: String,
    pub object_name: String,
    pub size: u64,
}

#[derive(Debug)]
pub struct LocalVault {
    root: PathBuf,
}

fn upload_error<E: std::fmt::Display>(context: impl Into<String>) -> impl FnOnce(E) -> Error {
    let context = context.into();
    move |e| Error::Upload(format!("{context}: {e}"))
}

impl LocalVault {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Upload(format!("vault {:?} is not a directory", root)));
        }
        Ok(Self { root })
    }

    pub fn archive_path(&self, id: &RemoteId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn entry(&self, id: &RemoteId) -> Result<VaultEntry> {
        let file = File::open(self.sidecar_path(id))
            .map_err(upload_error(format!("no vault entry for {id}")))?;
        Ok(serde_json::from_reader(file)?)
    }

    fn sidecar_path(&self, id: &RemoteId) -> PathBuf {
        self.root.join(format!("{}.json", id.as_str()))
    }

    /// Copies `readers` in order into a new vault file named after their digest.
    fn store<R: Read>(
        &self,
        descriptor: &UploadDescriptor,
        readers: impl IntoIterator<Item = R>,
    ) -> Result<RemoteId> {
        let staged = NamedTempFile::with_prefix_in(".incoming-", &self.root)
            .map_err(upload_error("cannot create vault file"))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        {
            let mut writer = BufWriter::new(staged.as_file());
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            for mut reader in readers {
                loop {
                    let n = reader
                        .read(&mut buf)
                        .map_err(upload_error("reading upload body failed"))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    writer
                        .write_all(&buf[..n])
                        .map_err(upload_error("writing vault file failed"))?;
                    size += n as u64;
                }
            }
            writer.flush().map_err(upload_error("writing vault file failed"))?;
        }
        staged
            .as_file()
            .sync_all()
            .map_err(upload_error("syncing vault file failed"))?;

        let id = RemoteId::from(format!("{:x}", hasher.finalize()));
        let entry = VaultEntry {
            description: descriptor.description().clone(),
            object_name: descriptor.object_name().clone(),
            size,
        };
        let archive = self.archive_path(&id);
        let replaced = archive.exists();
        staged
            .persist(&archive)
            .map_err(upload_error("storing vault file failed"))?;
        if let Err(e) = self.write_sidecar(&id, &entry) {
            // a fresh archive without its sidecar is unreachable, drop it
            if !replaced {
                if let Err(rm) = std::fs::remove_file(&archive) {
                    tracing::warn!("Failed to remove {:?}: {}", archive, rm);
                }
            }
            return Err(e);
        }
        tracing::info!("Stored {} bytes in vault as {}", size, id);
        Ok(id)
    }

    fn write_sidecar(&self, id: &RemoteId, entry: &VaultEntry) -> Result<()> {
        let mut staged = NamedTempFile::with_prefix_in(".sidecar-", &self.root)
            .map_err(upload_error("cannot create vault sidecar"))?;
        serde_json::to_writer_pretty(staged.as_file_mut(), entry)?;
        staged
            .as_file()
            .sync_all()
            .map_err(upload_error("syncing vault sidecar failed"))?;
        staged
            .persist(self.sidecar_path(id))
            .map_err(upload_error("writing vault sidecar failed"))?;
        Ok(())
    }
}

impl RemoteStore for LocalVault {
    fn put_object(
        &self,
        descriptor: &UploadDescriptor,
        body: &Path,
        content_length: u64,
    ) -> Result<RemoteId> {
        let file = File::open(body).map_err(upload_error(format!("cannot open {:?}", body)))?;
        let id = self.store(descriptor, [file])?;
        let stored = self.entry(&id)?.size;
        if stored != content_length {
            return Err(Error::Upload(format!(
                "stored {stored} bytes, expected {content_length}"
            )));
        }
        Ok(id)
    }

    fn create_multipart<'a>(
        &'a self,
        descriptor: &UploadDescriptor,
    ) -> Result<Box<dyn MultipartUpload + 'a>> {
        let staging = tempfile::Builder::new()
            .prefix(".multipart-")
            .tempdir_in(&self.root)
            .map_err(upload_error("cannot create multipart staging dir"))?;
        tracing::debug!("Staging multipart upload in {:?}", staging.path());
        Ok(Box::new(LocalMultipart {
            vault: self,
            descriptor: descriptor.clone(),
            staging,
            parts: Vec::new(),
        }))
    }
}

struct LocalMultipart<'a> {
    vault: &'a LocalVault,
    descriptor: UploadDescriptor,
    staging: TempDir,
    parts: Vec<PathBuf>,
}

impl MultipartUpload for LocalMultipart<'_> {
    fn upload_part(&mut self, part_number: u32, chunk: &[u8]) -> Result<()> {
        let expected = self.parts.len() as u32 + 1;
        if part_number != expected {
            return Err(Error::Upload(format!(
                "got part {part_number}, expected part {expected}"
            )));
        }
        let path = self.staging.path().join(format!("part-{part_number:05}"));
        std::fs::write(&path, chunk).map_err(upload_error(format!("writing part {part_number}")))?;
        self.parts.push(path);
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<RemoteId> {
        let LocalMultipart {
            vault,
            descriptor,
            staging,
            parts,
        } = *self;
        let files = parts
            .iter()
            .map(|p| File::open(p).map_err(upload_error(format!("reopening {:?}", p))))
            .collect::<Result<Vec<_>>>()?;
        let stored = vault.store(&descriptor, files);
        if let Err(e) = staging.close() {
            tracing::warn!("Failed to remove multipart staging dir: {}", e);
        }
        stored
    }

    fn abort(self: Box<Self>) -> Result<()> {
        self.staging
            .close()
            .map_err(upload_error("removing multipart staging dir"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> UploadDescriptor {
        UploadDescriptor::builder()
            .description("2024-01-01_00:00 vm1")
            .object_name("2024-01-01_0000_vm1.tar.gpg")
            .build()
    }

    fn hex_sha256(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn visible_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_put_object_is_content_addressed() {
        let vault_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(vault_dir.path()).unwrap();
        let body = vault_dir.path().join("body");
        std::fs::write(&body, b"encrypted archive").unwrap();

        let id = vault.put_object(&descriptor(), &body, 17).unwrap();

        assert_eq!(id.as_str(), hex_sha256(b"encrypted archive"));
        assert_eq!(std::fs::read(vault.archive_path(&id)).unwrap(), b"encrypted archive");
        let entry = vault.entry(&id).unwrap();
        assert_eq!(entry.description, "2024-01-01_00:00 vm1");
        assert_eq!(entry.size, 17);
    }

    #[test]
    fn test_put_object_length_mismatch() {
        let vault_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(vault_dir.path()).unwrap();
        let body = vault_dir.path().join("body");
        std::fs::write(&body, b"short").unwrap();

        let err = vault.put_object(&descriptor(), &body, 500).unwrap_err();
        assert!(matches!(err, Error::Upload(_)));
    }

    #[test]
    fn test_multipart_concatenates_parts() {
        let vault_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(vault_dir.path()).unwrap();

        let mut upload = vault.create_multipart(&descriptor()).unwrap();
        upload.upload_part(1, b"first ").unwrap();
        upload.upload_part(2, b"second ").unwrap();
        upload.upload_part(3, b"third").unwrap();
        let id = upload.complete().unwrap();

        assert_eq!(id.as_str(), hex_sha256(b"first second third"));
        assert_eq!(
            std::fs::read(vault.archive_path(&id)).unwrap(),
            b"first second third"
        );
        let id_str = id.to_string();
        assert_eq!(
            visible_entries(vault_dir.path()),
            vec![id_str.clone(), format!("{id_str}.json")]
        );
    }

    #[test]
    fn test_multipart_abort_leaves_nothing() {
        let vault_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(vault_dir.path()).unwrap();

        let mut upload = vault.create_multipart(&descriptor()).unwrap();
        upload.upload_part(1, b"first").unwrap();
        upload.abort().unwrap();

        assert!(visible_entries(vault_dir.path()).is_empty());
    }

    #[test]
    fn test_multipart_out_of_order_part_rejected() {
        let vault_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(vault_dir.path()).unwrap();

        let mut upload = vault.create_multipart(&descriptor()).unwrap();
        let err = upload.upload_part(2, b"second").unwrap_err();
        assert!(matches!(err, Error::Upload(_)));
    }

    #[test]
    fn test_failed_store_leaves_no_sidecar() {
        let vault_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(vault_dir.path()).unwrap();
        let body = TempDir::new().unwrap();
        let body = body.path().join("body");
        std::fs::write(&body, b"encrypted archive").unwrap();
        // a directory where the archive belongs makes the final rename fail
        let id = hex_sha256(b"encrypted archive");
        std::fs::create_dir(vault_dir.path().join(&id)).unwrap();

        let err = vault.put_object(&descriptor(), &body, 17).unwrap_err();

        assert!(matches!(err, Error::Upload(_)));
        assert_eq!(visible_entries(vault_dir.path()), vec![id]);
    }

    #[test]
    fn test_sidecar_written_through_rename() {
        let vault_dir = TempDir::new().unwrap();
        let vault = LocalVault::open(vault_dir.path()).unwrap();
        let body = TempDir::new().unwrap();
        let body = body.path().join("body");
        std::fs::write(&body, b"payload").unwrap();

        let id = vault.put_object(&descriptor(), &body, 7).unwrap();

        let id_str = id.to_string();
        assert_eq!(
            visible_entries(vault_dir.path()),
            vec![id_str.clone(), format!("{id_str}.json")]
        );
        assert_eq!(vault.entry(&id).unwrap().object_name, "2024-01-01_0000_vm1.tar.gpg");
    }

    #[test]
    fn test_open_missing_vault() {
        let temp_dir = TempDir::new().unwrap();
        assert!(LocalVault::open(temp_dir.path().join("missing")).is_err());
    }
}
