use crate::backup::pipeline::progress::human_size;
use crate::backup::pipeline::{Sink, StreamReader};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::{RemoteId, RemoteStore, UploadDescriptor};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Writes the whole stream to a temp file, uploads it on commit.
///
/// The temp file is removed when the sink goes away, whatever the outcome.
pub struct SpoolSink<'a> {
    store: &'a dyn RemoteStore,
    descriptor: UploadDescriptor,
    spool: NamedTempFile,
}

impl<'a> SpoolSink<'a> {
    pub fn new(
        store: &'a dyn RemoteStore,
        descriptor: UploadDescriptor,
        temp_dir: &Path,
    ) -> Result<Self> {
        let spool = tempfile::Builder::new()
            .prefix(&format!("{}.", descriptor.object_name()))
            .suffix(".spool")
            .tempfile_in(temp_dir)
            .map_err(|e| Error::Upload(format!("cannot create spool file in {:?}: {e}", temp_dir)))?;
        tracing::debug!("Spooling to {:?}", spool.path());
        Ok(Self {
            store,
            descriptor,
            spool,
        })
    }

    pub fn spool_path(&self) -> &Path {
        self.spool.path()
    }

    fn remove_spool(spool: NamedTempFile) {
        let path = spool.path().to_path_buf();
        if let Err(e) = spool.close() {
            tracing::warn!("Failed to remove spool file {:?}: {}", path, e);
        }
    }
}

impl Sink for SpoolSink<'_> {
    type Output = RemoteId;

    fn consume(&mut self, input: &mut StreamReader) -> Result<()> {
        let file = self.spool.as_file_mut();
        std::io::copy(input, file)
            .and_then(|_| file.flush())
            .map_err(|e| Error::Upload(format!("writing spool file failed: {e}")))
    }

    fn commit(self) -> Result<RemoteId> {
        let SpoolSink {
            store,
            descriptor,
            spool,
        } = self;
        let uploaded = spool
            .as_file()
            .metadata()
            .map_err(|e| Error::Upload(format!("cannot stat spool file: {e}")))
            .and_then(|md| {
                tracing::info!(
                    "Sending {} file {:?}",
                    human_size(md.len()),
                    descriptor.object_name()
                );
                store.put_object(&descriptor, spool.path(), md.len())
            });
        Self::remove_spool(spool);
        uploaded
    }

    fn abandon(self) {
        tracing::debug!("Discarding spool file {:?}", self.spool.path());
        Self::remove_spool(self.spool);
    }
}
