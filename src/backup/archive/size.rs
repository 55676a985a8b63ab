use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::path::Path;
use walkdir::WalkDir;

/// Total size in bytes of the regular files below `path`, symlinks not followed.
///
/// Used as the expected total of the progress tap.
pub fn directory_size<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .try_fold(0u64, |total, entry| {
            let entry = entry.map_err(|e| Error::SizeQuery(format!("{:?}: {e}", path)))?;
            if !entry.file_type().is_file() {
                return Ok(total);
            }
            let metadata = entry
                .metadata()
                .map_err(|e| Error::SizeQuery(format!("{:?}: {e}", entry.path())))?;
            Ok(total + metadata.len())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_size_sums_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        std::fs::write(temp_dir.path().join("one"), vec![0u8; 1000]).unwrap();
        std::fs::write(temp_dir.path().join("a/two"), vec![0u8; 2000]).unwrap();
        std::fs::write(temp_dir.path().join("a/b/three"), vec![0u8; 3000]).unwrap();

        assert_eq!(directory_size(temp_dir.path()).unwrap(), 6000);
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(directory_size(temp_dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_missing_directory_is_size_query_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = directory_size(temp_dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::SizeQuery(_)));
    }
}
