use crate::backup::archive::split_source;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithFnName;
use function_name::named;
use std::io::Write;
use std::path::Path;
use walkdir::WalkDir;

/// Writes a tar archive of `source_dir` to `writer`
///
/// Entries are stored under the directory's own name, in file-name order,
/// so the same tree always yields the same entry order. Symlinks are stored
/// as links and never followed.
#[named]
pub fn write_archive<W: Write>(source_dir: &Path, writer: W) -> Result<W> {
    let (base, _) = split_source(source_dir)?;
    if !source_dir.is_dir() {
        return Err(Error::ArchiveRead(format!(
            "{:?} is not a directory",
            source_dir
        )));
    }

    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let mut entry_count = 0usize;
    for entry in WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::ArchiveRead(e.to_string()))?;
        let dst = entry
            .path()
            .strip_prefix(base)
            .map_err(|e| Error::ArchiveRead(format!("{:?}: {e}", entry.path())))?;
        tracing::trace!("Including {:?} as {:?}", entry.path(), dst);
        builder
            .append_path_with_name(entry.path(), dst)
            .map_err(|e| Error::ArchiveRead(format!("{:?}: {e}", entry.path())))?;
        entry_count += 1;
    }
    tracing::info!("Processed {} archive entries", entry_count);

    builder
        .into_inner()
        .map_err(|e| Error::ArchiveRead(format!("finishing archive failed: {e}")))
        .with_fn_name(function_path!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_files(dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir.join("subdir"))?;
        std::fs::write(dir.join("file1.txt"), "content1")?;
        std::fs::write(dir.join("machine.vbox"), "<VirtualBox/>")?;
        std::fs::write(dir.join("subdir/disk.vdi"), vec![42u8; 300_000])?;
        Ok(())
    }

    #[test]
    fn test_round_trip_reproduces_tree() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("vm1");
        create_test_files(&src).unwrap();

        let bytes = write_archive(&src, Vec::new()).unwrap();

        let out = TempDir::new().unwrap();
        tar::Archive::new(bytes.as_slice()).unpack(out.path()).unwrap();
        let restored = out.path().join("vm1");
        assert_eq!(std::fs::read(restored.join("file1.txt")).unwrap(), b"content1");
        assert_eq!(
            std::fs::read(restored.join("machine.vbox")).unwrap(),
            b"<VirtualBox/>"
        );
        assert_eq!(
            std::fs::read(restored.join("subdir/disk.vdi")).unwrap(),
            vec![42u8; 300_000]
        );
    }

    #[test]
    fn test_entries_in_sorted_order() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("vm1");
        create_test_files(&src).unwrap();

        let bytes = write_archive(&src, Vec::new()).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_string())
            .collect();

        assert_eq!(
            names,
            vec![
                "vm1",
                "vm1/file1.txt",
                "vm1/machine.vbox",
                "vm1/subdir",
                "vm1/subdir/disk.vdi"
            ]
        );
    }

    #[test]
    fn test_same_tree_same_entry_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("vm1");
        create_test_files(&src).unwrap();

        let first = write_archive(&src, Vec::new()).unwrap();
        let second = write_archive(&src, Vec::new()).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_stored_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("vm1");
        create_test_files(&src).unwrap();
        std::os::unix::fs::symlink("/etc/hostname", src.join("link")).unwrap();

        let bytes = write_archive(&src, Vec::new()).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let link = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().ends_with("link"))
            .unwrap();
        assert!(link.header().entry_type().is_symlink());
    }

    #[test]
    fn test_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let err = write_archive(&temp_dir.path().join("missing"), Vec::new()).unwrap_err();
        assert!(matches!(err.primary(), Error::ArchiveRead(_)));
    }
}
