pub mod archive;
pub mod backup_config;
pub mod encrypt;
pub mod file_ext;
pub mod pipeline;
pub mod record;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod secret;
pub mod source;
pub mod upload;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
