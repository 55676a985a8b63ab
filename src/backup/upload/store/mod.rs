pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::upload::store::local::{LocalVault, LocalVaultConfig};
#[cfg(feature = "s3")]
use crate::backup::upload::store::s3::{S3Store, S3StoreConfig};
use crate::backup::upload::RemoteStore;
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::result;
use validator::{Validate, ValidationErrors};

/// Where archives are uploaded to
#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "store_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StoreConfig {
    Local(LocalVaultConfig),
    #[cfg(feature = "s3")]
    S3(S3StoreConfig),
}

impl Validate for StoreConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            StoreConfig::Local(inner) => inner.validate(),
            #[cfg(feature = "s3")]
            StoreConfig::S3(inner) => inner.validate(),
        }
    }
}

impl StoreConfig {
    /// Smallest part size the store accepts for every part but the last.
    pub fn min_part_size(&self) -> u64 {
        match self {
            StoreConfig::Local(_) => crate::backup::upload::MIN_CHUNK_SIZE,
            #[cfg(feature = "s3")]
            StoreConfig::S3(_) => s3::S3_MIN_PART_SIZE,
        }
    }

    /// Directory the store writes into on this host, if any.
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            StoreConfig::Local(local) => Some(local.path()),
            #[cfg(feature = "s3")]
            StoreConfig::S3(_) => None,
        }
    }

    pub fn build_store(&self) -> Result<Box<dyn RemoteStore>> {
        match self {
            StoreConfig::Local(local) => {
                tracing::info!("Using local vault at {:?}", local.path());
                LocalVault::open(local.path()).map(|v| Box::new(v) as Box<dyn RemoteStore>)
            }
            #[cfg(feature = "s3")]
            StoreConfig::S3(s3) => {
                tracing::info!("Using S3 bucket {:?}", s3.bucket());
                S3Store::connect(s3).map(|s| Box::new(s) as Box<dyn RemoteStore>)
            }
        }
        .with_debug_object_and_fn_name(self.clone(), "build_store")
    }
}
