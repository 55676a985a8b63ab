use crate::backup::archive::size::directory_size;
use crate::backup::archive::{ArchiveStageBuilder, ArchiverConfig};
use crate::backup::encrypt::gpg::GpgEncryptorConfig;
use crate::backup::encrypt::EncryptStageBuilder;
use crate::backup::file_ext::file_name_with_exts;
use crate::backup::function_path;
use crate::backup::pipeline::progress::ProgressTap;
use crate::backup::pipeline::Pipeline;
use crate::backup::record::{ArchiveLog, ArchiveRecord};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithFnName, WithMsg};
use crate::backup::retention::RetentionConfig;
use crate::backup::source::BackupSource;
use crate::backup::upload::store::StoreConfig;
use crate::backup::upload::{RemoteStore, UploadConfig, UploadDescriptor, UploadMode};
use crate::backup::validate::{validate_file_in_writable_dir, validate_writable_dir};
use bon::Builder;
use chrono::{DateTime, Utc};
use function_name::named;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use validator::{Validate, ValidationError};

#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_chunk_size_for_store))]
pub struct BackupConfig {
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    #[getset(get = "pub")]
    archiver: ArchiverConfig,
    #[validate(nested)]
    #[getset(get = "pub")]
    encryptor: GpgEncryptorConfig,
    #[validate(nested)]
    #[getset(get = "pub")]
    store: StoreConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    #[getset(get = "pub")]
    upload: UploadConfig,
    /// Spool files are created here
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    #[getset(get = "pub")]
    temp_dir: PathBuf,
    /// CSV list of uploaded archives
    #[validate(custom(function = validate_file_in_writable_dir))]
    #[builder(into)]
    #[getset(get = "pub")]
    archive_list_file: PathBuf,
    /// Disables progress reporting
    #[serde(default)]
    #[builder(default)]
    #[getset(get_copy = "pub")]
    quiet: bool,
    #[validate(nested)]
    #[getset(get = "pub")]
    retention: Option<RetentionConfig>,
}

fn validate_chunk_size_for_store(config: &BackupConfig) -> std::result::Result<(), ValidationError> {
    let min = config.store.min_part_size();
    if config.upload.mode() == UploadMode::Multipart && config.upload.chunk_size() < min {
        return Err(ValidationError::new("InvalidChunkSize").with_message(
            format!(
                "chunk_size {} is below the {} bytes the store accepts",
                config.upload.chunk_size(),
                min
            )
            .into(),
        ));
    }
    Ok(())
}

impl BackupConfig {
    /// Reads and validates a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: BackupConfig = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader(f).map_err(Error::from))
            .with_msg(format!("Parse YAML config failed: {:?}", path))?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Config validation failed: {:?}", path))?;
        Ok(config)
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

/// Runs backups of source directories against one configured store.
pub struct BackupJob {
    config: BackupConfig,
    store: Box<dyn RemoteStore>,
    archive_log: ArchiveLog,
}

impl BackupJob {
    pub fn new(config: BackupConfig) -> Result<Self> {
        let store = config.store.build_store()?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: BackupConfig, store: Box<dyn RemoteStore>) -> Self {
        let archive_log = ArchiveLog::new(config.archive_list_file.clone());
        Self {
            config,
            store,
            archive_log,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn archive_log(&self) -> &ArchiveLog {
        &self.archive_log
    }

    /// Plaintext size of `source`, only queried when progress is reported.
    pub fn size_estimate(&self, source: &BackupSource) -> Result<Option<u64>> {
        if self.config.quiet {
            return Ok(None);
        }
        directory_size(source.path()).map(Some)
    }

    /// Archive, optional progress tap, then encryption.
    pub fn pipeline(&self, source: &BackupSource, size_estimate: Option<u64>) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new(self.config.archiver.build_archive_stage(source)?);
        if !self.config.quiet {
            pipeline = pipeline.then(ProgressTap::new(source.description(), size_estimate).into_stage());
        }
        Ok(pipeline.then(self.config.encryptor.build_encrypt_stage()?))
    }

    pub fn descriptor(&self, source: &BackupSource, size_estimate: Option<u64>) -> UploadDescriptor {
        let object_name = file_name_with_exts(
            &source.archive_base_name(),
            &[&self.config.archiver, &self.config.encryptor],
        );
        UploadDescriptor::builder()
            .description(source.description())
            .object_name(object_name)
            .maybe_size_estimate(size_estimate)
            .build()
    }

    /// Archives, encrypts and uploads `source`, then records it.
    ///
    /// Nothing is recorded unless the upload was committed.
    #[named]
    pub fn run(&self, source: &BackupSource) -> Result<ArchiveRecord> {
        self.backup(source)
            .with_fn_name(function_path!())
            .with_msg(format!("Backup of {:?} failed", source.path()))
    }

    fn backup(&self, source: &BackupSource) -> Result<ArchiveRecord> {
        info!("Backing up {:?} as {:?}", source.path(), source.description());
        self.check_not_self_referencing(source)?;

        let size_estimate = self.size_estimate(source)?;
        let pipeline = self.pipeline(source, size_estimate)?;
        let sink = self.config.upload.sink(
            self.store.as_ref(),
            self.descriptor(source, size_estimate),
            &self.config.temp_dir,
        )?;
        let remote_id = pipeline.run(sink)?;
        info!("Uploaded {:?} as {}", source.description(), remote_id);
        self.archive_log.append(&source.description(), &remote_id)
    }

    /// Runs every source in turn. A failed source does not stop the others.
    pub fn run_all<'s, I>(&self, sources: I) -> Vec<Result<ArchiveRecord>>
    where
        I: IntoIterator<Item = &'s BackupSource>,
    {
        sources
            .into_iter()
            .map(|source| {
                let result = self.run(source);
                if let Err(e) = &result {
                    error!("{e}");
                }
                result
            })
            .collect()
    }

    /// Records past the retention horizon, oldest first. Empty without a retention config.
    pub fn expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<ArchiveRecord>> {
        let Some(retention) = &self.config.retention else {
            warn!("No retention configured, nothing expires");
            return Ok(Vec::new());
        };
        let records = self.archive_log.records()?;
        Ok(retention
            .expired(&records, now)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Refuses sources that contain a directory this job writes into while archiving.
    fn check_not_self_referencing(&self, source: &BackupSource) -> Result<()> {
        let resolve = |p: &Path| {
            std::fs::canonicalize(p)
                .or_else(|_| std::path::absolute(p))
                .unwrap_or_else(|_| p.to_path_buf())
        };
        let source_dir = resolve(source.path());

        let mut written = Vec::new();
        if self.config.upload.mode() == UploadMode::Spool {
            written.push(("temp_dir", self.config.temp_dir.as_path()));
        }
        if let Some(vault) = self.config.store.local_path() {
            written.push(("vault", vault));
        }

        match written
            .into_iter()
            .find(|(_, dir)| resolve(*dir).starts_with(&source_dir))
        {
            Some((what, dir)) => Err(Error::ArchiveRead(format!(
                "{what} {:?} is inside the source directory {:?}",
                dir,
                source.path()
            ))),
            None => Ok(()),
        }
    }
}
