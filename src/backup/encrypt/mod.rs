pub mod gpg;

use crate::backup::encrypt::gpg::{Direction, GpgEncryptorConfig};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::pipeline::{Pipeline, Sink, Stage, StreamReader, TaskStage};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

pub trait EncryptStageBuilder {
    fn build_encrypt_stage(&self) -> Result<Stage>;
}

impl EncryptStageBuilder for GpgEncryptorConfig {
    fn build_encrypt_stage(&self) -> Result<Stage> {
        tracing::info!("Initializing gpg symmetric encryption with {:?}", self.executable());
        self.stage(Direction::Encrypt)
            .map(Stage::from)
            .with_debug_object_and_fn_name(self.clone(), "build_encrypt_stage")
    }
}

static GPG_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for GpgEncryptorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(GPG_FILE_EXT.get_or_init(|| "gpg".into()).clone())
    }
}

struct WriteSink<W: Write> {
    writer: W,
}

impl<W: Write> Sink for WriteSink<W> {
    type Output = W;

    fn consume(&mut self, input: &mut StreamReader) -> Result<()> {
        std::io::copy(input, &mut self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    fn commit(self) -> Result<W> {
        Ok(self.writer)
    }

    fn abandon(self) {}
}

impl GpgEncryptorConfig {
    /// Decrypts the archive at `encrypted` into `output`.
    ///
    /// On error `output` may hold a partial plaintext and must be discarded.
    pub fn decrypt_file<W: Write>(&self, encrypted: &Path, output: W) -> Result<W> {
        let file = File::open(encrypted)
            .map_err(Error::from)
            .with_msg(format!("Cannot open {:?}", encrypted))?;
        let path: PathBuf = encrypted.to_path_buf();
        let reader = TaskStage::new("read", move |_, mut out| {
            let mut file = file;
            std::io::copy(&mut file, &mut out)
                .map(|_| ())
                .map_err(Error::from)
                .with_msg(format!("Reading {:?} failed", path))
        });
        Pipeline::new(reader)
            .then(self.stage(Direction::Decrypt)?)
            .run(WriteSink { writer: output })
    }
}
