//! Uploading the encrypted stream to a remote store.
//!
//! Two strategies, both implemented as pipeline [`Sink`]s so nothing becomes
//! durable before every stage has succeeded:
//!
//! - [`spool::SpoolSink`] writes the stream to a temp file and uploads it in
//!   one request once the size is known.
//! - [`chunked::ChunkedSink`] sends fixed size parts of a multipart upload
//!   while the stream is still being produced, holding back the last part
//!   until commit.

pub mod chunked;
pub mod spool;
pub mod store;

use crate::backup::pipeline::{Sink, StreamReader};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::chunked::ChunkedSink;
use crate::backup::upload::spool::SpoolSink;
use bon::Builder;
use derive_more::{Deref, Display, From, Into};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

/// Smallest accepted multipart chunk
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Opaque identifier a store returns for an uploaded archive
#[derive(Clone, Debug, PartialEq, Eq, Hash, Display, From, Into, Deref, Serialize, Deserialize)]
pub struct RemoteId(String);

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What the store is told about the archive being uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct UploadDescriptor {
    /// `"<timestamp> <name>"`
    #[builder(into)]
    #[getset(get = "pub")]
    description: String,
    /// File or object name, extensions included
    #[builder(into)]
    #[getset(get = "pub")]
    object_name: String,
    #[getset(get_copy = "pub")]
    size_estimate: Option<u64>,
}

/// A store archives can be uploaded to.
pub trait RemoteStore: Send + Sync {
    /// Uploads the complete file at `body` in one request.
    fn put_object(
        &self,
        descriptor: &UploadDescriptor,
        body: &Path,
        content_length: u64,
    ) -> Result<RemoteId>;

    /// Starts a multipart upload. Parts are numbered from 1.
    fn create_multipart<'a>(
        &'a self,
        descriptor: &UploadDescriptor,
    ) -> Result<Box<dyn MultipartUpload + 'a>>;
}

/// An upload in progress. Either `complete` or `abort` must end it.
pub trait MultipartUpload {
    fn upload_part(&mut self, part_number: u32, chunk: &[u8]) -> Result<()>;

    /// Makes the archive visible. An implementation aborts the upload itself when this fails.
    fn complete(self: Box<Self>) -> Result<RemoteId>;

    fn abort(self: Box<Self>) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Spool to a temp file, then a single upload
    #[default]
    Spool,
    /// Multipart upload while the stream is produced
    Multipart,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, CopyGetters, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct UploadConfig {
    #[serde(default)]
    #[builder(default)]
    mode: UploadMode,
    /// Bytes per multipart chunk
    #[serde(default = "default_chunk_size")]
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    #[validate(range(min = 1048576))]
    chunk_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl UploadConfig {
    /// Sink uploading to `store` in the configured mode. Spool files go to `temp_dir`.
    pub fn sink<'a>(
        &self,
        store: &'a dyn RemoteStore,
        descriptor: UploadDescriptor,
        temp_dir: &Path,
    ) -> Result<UploadSink<'a>> {
        Ok(match self.mode {
            UploadMode::Spool => SpoolSink::new(store, descriptor, temp_dir)?.into(),
            UploadMode::Multipart => {
                ChunkedSink::new(store, descriptor, chunk_len(self.chunk_size)?).into()
            }
        })
    }
}

/// Chunk size as an in-memory buffer length.
fn chunk_len(chunk_size: u64) -> Result<usize> {
    usize::try_from(chunk_size).map_err(|_| {
        Error::Upload(format!(
            "chunk_size {chunk_size} does not fit in memory on this platform"
        ))
    })
}

#[derive(From)]
pub enum UploadSink<'a> {
    Spool(SpoolSink<'a>),
    Chunked(ChunkedSink<'a>),
}

impl Sink for UploadSink<'_> {
    type Output = RemoteId;

    fn consume(&mut self, input: &mut StreamReader) -> Result<()> {
        match self {
            UploadSink::Spool(s) => s.consume(input),
            UploadSink::Chunked(s) => s.consume(input),
        }
    }

    fn commit(self) -> Result<RemoteId> {
        match self {
            UploadSink::Spool(s) => s.commit(),
            UploadSink::Chunked(s) => s.commit(),
        }
    }

    fn abandon(self) {
        match self {
            UploadSink::Spool(s) => s.abandon(),
            UploadSink::Chunked(s) => s.abandon(),
        }
    }
}
