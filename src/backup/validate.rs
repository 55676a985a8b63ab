//! Validation functions for configuration values.
//!
//! Directory checks for the temp dir, the local vault and the archive list
//! file location.

use validator::ValidationError;

use std::path::Path;

fn invalid_dir(message: String) -> ValidationError {
    ValidationError::new("InvalidDirectory").with_message(message.into())
}

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Err(invalid_dir(format!("{:?} not found", dir)));
    }
    if !dir.is_dir() {
        return Err(invalid_dir(format!("{:?} is not a directory", dir)));
    }
    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        return validate_dir_exist(dir);
    }
    std::fs::create_dir_all(dir).map_err(|e| {
        invalid_dir(format!("cannot create or access directory {:?}: {}", dir, e))
    })
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir)
        .map_err(|e| invalid_dir(format!("cannot access metadata for {:?}: {}", dir, e)))?;
    if md.permissions().readonly() {
        Err(invalid_dir(format!("cannot write to dir {:?}", dir)))
    } else {
        Ok(())
    }
}

/// The file may not exist yet, but its directory must be writable.
pub fn validate_file_in_writable_dir<P: AsRef<Path>>(file: P) -> Result<(), ValidationError> {
    let file = file.as_ref();
    if file.is_dir() {
        return Err(ValidationError::new("InvalidFile")
            .with_message(format!("{:?} is a directory", file).into()));
    }
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => validate_writable_dir(parent),
        _ => validate_writable_dir("."),
    }
}
