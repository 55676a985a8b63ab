//! # offsite-backup
//!
//! Streams a directory to offsite storage as an encrypted archive, without
//! a plaintext copy ever touching the disk.
//!
//! ## Features
//!
//! - **Streaming pipeline**: archiver, progress tap and encryptor connected by OS pipes
//! - **Archiving**: external `tar` or a builtin tar writer
//! - **Encryption**: GnuPG symmetric AES256, passphrase passed through an anonymous pipe
//! - **Upload**: spool-then-upload or direct multipart, to a local vault or S3 (`s3` feature)
//! - **Archive list**: append-only CSV of description and remote id
//! - **Retention**: lists archives past their expiry horizon
//!
//! ## Quick Start
//!
//! ```no_run
//! use chrono::Utc;
//! use offsite_backup::backup::backup_config::{BackupConfig, BackupJob};
//! use offsite_backup::backup::source::BackupSource;
//!
//! let config = BackupConfig::load("offsite-backup.yml")?;
//! let job = BackupJob::new(config)?;
//! let record = job.run(&BackupSource::from_dir("/srv/vms/vm1", Utc::now())?)?;
//! println!("{},{}", record.description(), record.remote_id());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
