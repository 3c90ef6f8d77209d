//! Session-private scratch files
//!
//! Each transfer owns exactly one [`ScratchFile`]. The file is unlinked when
//! the value is dropped, so handle close, transfer failure, panics in the
//! protocol task and connection teardown all clean up the same way.

use crate::Result;
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile, TempPath};
use tracing::{debug, warn};

/// Prefix of every scratch file name
pub const SCRATCH_PREFIX: &str = "cirrus-";

/// Allocates scratch files inside one directory
#[derive(Debug, Clone)]
pub struct ScratchDir {
    dir: PathBuf,
}

impl ScratchDir {
    /// Use `dir` for scratch files
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the scratch files
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if it does not exist
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Create a new empty scratch file
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created
    pub fn allocate(&self) -> Result<ScratchFile> {
        let file = Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempfile_in(&self.dir)?;
        debug!(path = %file.path().display(), "Allocated scratch file");
        Ok(ScratchFile::from_named(file))
    }
}

/// A scratch file that is removed on drop
#[derive(Debug)]
pub struct ScratchFile {
    path: TempPath,
    file: std::fs::File,
}

impl ScratchFile {
    fn from_named(named: NamedTempFile) -> Self {
        let (file, path) = named.into_parts();
        Self { path, file }
    }

    /// Location on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open an independent async handle on the same file
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the descriptor cannot be duplicated
    pub fn handle(&self) -> Result<tokio::fs::File> {
        Ok(tokio::fs::File::from_std(self.file.try_clone()?))
    }

    /// Open a read-only handle on the file
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened
    pub async fn open_read(&self) -> Result<tokio::fs::File> {
        Ok(tokio::fs::File::open(&*self.path).await?)
    }

    /// Remove the file now, logging instead of failing
    pub fn remove(self) {
        let shown = self.path.display().to_string();
        if let Err(e) = self.path.close() {
            warn!(path = %shown, error = %e, "Failed to remove scratch file");
        } else {
            debug!(path = %shown, "Removed scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_allocate_uses_prefix() {
        let tmp = TempDir::new().unwrap();
        let scratch = ScratchDir::new(tmp.path());
        let file = scratch.allocate().unwrap();

        let name = file.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(SCRATCH_PREFIX));
        assert_eq!(file.path().parent().unwrap(), tmp.path());
    }

    #[test]
    fn test_drop_and_remove_delete_file() {
        let tmp = TempDir::new().unwrap();
        let scratch = ScratchDir::new(tmp.path());

        let dropped = scratch.allocate().unwrap();
        let removed = scratch.allocate().unwrap();
        assert_eq!(entries(tmp.path()), 2);

        drop(dropped);
        removed.remove();
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_ensure_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let scratch = ScratchDir::new(tmp.path().join("nested").join("scratch"));
        scratch.ensure().unwrap();
        assert!(scratch.path().is_dir());
    }
}
