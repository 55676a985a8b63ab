//! AWS S3 (or compatible) store.
//!
//! The SDK is async; every call is driven to completion on a private
//! current-thread Tokio runtime so the rest of the crate stays synchronous.

use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::{MultipartUpload, RemoteId, RemoteStore, UploadDescriptor};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::Path;
use tokio::runtime::Runtime;
use validator::Validate;

/// S3 rejects smaller parts except for the last one
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Object metadata key holding the backup description
static DESCRIPTION_METADATA: &str = "description";

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct S3StoreConfig {
    #[validate(length(min = 3, max = 63))]
    #[builder(into)]
    bucket: String,
    /// Prepended to every object key, e.g. `vm-backups/`
    #[serde(default)]
    #[builder(default, into)]
    prefix: String,
    #[builder(into)]
    region: Option<String>,
    /// For S3 compatible services
    #[builder(into)]
    endpoint_url: Option<String>,
    #[serde(default)]
    #[builder(default)]
    force_path_style: bool,
    /// Falls back to the default AWS credential chain when unset
    #[builder(into)]
    access_key_id: Option<String>,
    #[validate(nested)]
    #[builder(into)]
    secret_access_key: Option<RedactedString>,
}

pub struct S3Store {
    client: Client,
    runtime: Runtime,
    bucket: String,
    prefix: String,
}

fn s3_error<E: std::error::Error>(context: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::Upload(format!("{context}: {}", DisplayErrorContext(e)))
}

/// Object key for `object_name` under `prefix`.
pub fn object_key(prefix: &str, object_name: &str) -> String {
    format!("{prefix}{object_name}")
}

/// The key, plus the version when the bucket is versioned.
pub fn remote_id(key: &str, version_id: Option<&str>) -> RemoteId {
    match version_id {
        Some(version) => RemoteId::from(format!("{key}?versionId={version}")),
        None => RemoteId::from(key),
    }
}

impl S3Store {
    pub fn connect(config: &S3StoreConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = config.region() {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = config.endpoint_url() {
            loader = loader.endpoint_url(endpoint);
        }
        match (config.access_key_id(), config.secret_access_key()) {
            (Some(id), Some(secret)) => {
                loader = loader.credentials_provider(Credentials::new(
                    id,
                    secret.secret(),
                    None,
                    None,
                    "offsite-backup-config",
                ));
            }
            (None, None) => {}
            _ => {
                return Err(Error::Upload(
                    "access_key_id and secret_access_key must be set together".into(),
                ))
            }
        }
        let sdk_config = runtime.block_on(loader.load());
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(*config.force_path_style())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            runtime,
            bucket: config.bucket().clone(),
            prefix: config.prefix().clone(),
        })
    }

    fn key(&self, descriptor: &UploadDescriptor) -> String {
        object_key(&self.prefix, descriptor.object_name())
    }
}

impl RemoteStore for S3Store {
    fn put_object(
        &self,
        descriptor: &UploadDescriptor,
        body: &Path,
        content_length: u64,
    ) -> Result<RemoteId> {
        let key = self.key(descriptor);
        tracing::info!("Uploading s3://{}/{}", self.bucket, key);
        let output = self.runtime.block_on(async {
            let body = ByteStream::from_path(body)
                .await
                .map_err(s3_error("reading spool file failed"))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .metadata(DESCRIPTION_METADATA, descriptor.description())
                .content_length(content_length as i64)
                .body(body)
                .send()
                .await
                .map_err(s3_error("put_object failed"))
        })?;
        Ok(remote_id(&key, output.version_id()))
    }

    fn create_multipart<'a>(
        &'a self,
        descriptor: &UploadDescriptor,
    ) -> Result<Box<dyn MultipartUpload + 'a>> {
        let key = self.key(descriptor);
        let output = self
            .runtime
            .block_on(
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .metadata(DESCRIPTION_METADATA, descriptor.description())
                    .send(),
            )
            .map_err(s3_error("create_multipart_upload failed"))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| Error::Upload("no upload id returned".into()))?
            .to_string();
        tracing::info!("Started multipart upload of s3://{}/{}", self.bucket, key);
        Ok(Box::new(S3Multipart {
            store: self,
            key,
            upload_id,
            parts: Vec::new(),
        }))
    }
}

struct S3Multipart<'a> {
    store: &'a S3Store,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl S3Multipart<'_> {
    fn abort_upload(&self) -> Result<()> {
        self.store
            .runtime
            .block_on(
                self.store
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.store.bucket)
                    .key(&self.key)
                    .upload_id(&self.upload_id)
                    .send(),
            )
            .map(|_| ())
            .map_err(s3_error("abort_multipart_upload failed"))
    }
}

impl MultipartUpload for S3Multipart<'_> {
    fn upload_part(&mut self, part_number: u32, chunk: &[u8]) -> Result<()> {
        let output = self
            .store
            .runtime
            .block_on(
                self.store
                    .client
                    .upload_part()
                    .bucket(&self.store.bucket)
                    .key(&self.key)
                    .upload_id(&self.upload_id)
                    .part_number(part_number as i32)
                    .body(ByteStream::from(chunk.to_vec()))
                    .send(),
            )
            .map_err(s3_error("upload_part failed"))?;
        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number as i32)
                .set_e_tag(output.e_tag().map(str::to_string))
                .build(),
        );
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<RemoteId> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();
        let result = self
            .store
            .runtime
            .block_on(
                self.store
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.store.bucket)
                    .key(&self.key)
                    .upload_id(&self.upload_id)
                    .multipart_upload(completed)
                    .send(),
            )
            .map_err(s3_error("complete_multipart_upload failed"));
        match result {
            Ok(output) => Ok(remote_id(&self.key, output.version_id())),
            Err(e) => {
                if let Err(abort) = self.abort_upload() {
                    tracing::warn!("{}", abort);
                }
                Err(e)
            }
        }
    }

    fn abort(self: Box<Self>) -> Result<()> {
        self.abort_upload()
    }
}
