//! Filesystem adapter
//!
//! Maps path-based SFTP operations onto an [`ObjectStore`] container. The
//! adapter is split into four capabilities so each can be faked on its own:
//!
//! - [`FileReader`]: open an object for offset reads
//! - [`FileWriter`]: open an object for offset writes
//! - [`FileCommander`]: rename, remove and the unsupported structural commands
//! - [`FileLister`]: list and stat
//!
//! [`ObjectFs`] implements all four. Its commands run behind one adapter-wide
//! lock; transfer bodies run outside it.
//!
//! Listing scans the whole container on every call, so each `list`/`opendir`
//! costs O(objects in the container). Large containers should be split.

use crate::scratch::ScratchDir;
use crate::session::SessionInfo;
use crate::transfer::{ReadTransfer, WriteTransfer};
use crate::vfs::{self, VirtualFile};
use crate::{Error, Result};
use async_trait::async_trait;
use cirrus_store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Structural commands a client can issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Move `from` to `to`
    Rename {
        /// Source path
        from: String,
        /// Destination path
        to: String,
    },
    /// Delete a file
    Remove {
        /// Path to delete
        path: String,
    },
    /// Create a directory
    Mkdir {
        /// Directory path
        path: String,
    },
    /// Remove a directory
    Rmdir {
        /// Directory path
        path: String,
    },
    /// Change permissions, ownership or times
    Setstat {
        /// Target path
        path: String,
    },
    /// Create a symbolic link
    Symlink {
        /// Link path
        link: String,
        /// Link target
        target: String,
    },
}

impl Command {
    /// Short operation name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::Rename { .. } => "rename",
            Command::Remove { .. } => "remove",
            Command::Mkdir { .. } => "mkdir",
            Command::Rmdir { .. } => "rmdir",
            Command::Setstat { .. } => "setstat",
            Command::Symlink { .. } => "symlink",
        }
    }
}

/// Opens objects for reading
#[async_trait]
pub trait FileReader: Send + Sync {
    /// Open `path` for offset reads
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no object backs the path
    async fn open_read(&self, ctx: &SessionInfo, path: &str) -> Result<ReadTransfer>;
}

/// Opens objects for writing
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Open `path` for offset writes with create-or-truncate semantics
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] for the root or reserved paths
    async fn open_write(&self, ctx: &SessionInfo, path: &str) -> Result<WriteTransfer>;
}

/// Executes structural commands
#[async_trait]
pub trait FileCommander: Send + Sync {
    /// Run one command
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] for commands with no object equivalent
    async fn execute(&self, ctx: &SessionInfo, command: Command) -> Result<()>;
}

/// Lists directories and stats paths
#[async_trait]
pub trait FileLister: Send + Sync {
    /// Direct children of the directory at `path`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing exists at or below `path`
    async fn list(&self, ctx: &SessionInfo, path: &str) -> Result<Vec<VirtualFile>>;

    /// Attributes of the file or directory at `path`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing exists at or below `path`
    async fn stat(&self, ctx: &SessionInfo, path: &str) -> Result<VirtualFile>;
}

/// Everything the SFTP handler needs from a filesystem
pub trait Filesystem: FileReader + FileWriter + FileCommander + FileLister {}

impl<T: FileReader + FileWriter + FileCommander + FileLister> Filesystem for T {}

/// Filesystem adapter over one object container
pub struct ObjectFs {
    store: Arc<dyn ObjectStore>,
    container: String,
    scratch: ScratchDir,
    transfer_timeout: Duration,
    lock: Mutex<()>,
}

impl ObjectFs {
    /// Create an adapter over `container`
    pub fn new(
        store: Arc<dyn ObjectStore>,
        container: impl Into<String>,
        scratch: ScratchDir,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            store,
            container: container.into(),
            scratch,
            transfer_timeout,
            lock: Mutex::new(()),
        }
    }

    /// Container served by this adapter
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Stat without taking the adapter lock
    async fn stat_key(&self, key: &str) -> Result<VirtualFile> {
        if key.is_empty() {
            return Ok(VirtualFile::root());
        }

        match self.store.get_metadata(&self.container, key).await {
            Ok(meta) => return Ok(VirtualFile::file(key, meta.size, meta.last_modified)),
            Err(e) if !e.is_not_found() => return Err(e.into()),
            Err(_) => {}
        }

        let marker = vfs::dir_prefix(key);
        match self.store.get_metadata(&self.container, &marker).await {
            Ok(meta) => return Ok(VirtualFile::directory(marker, meta.last_modified)),
            Err(e) if !e.is_not_found() => return Err(e.into()),
            Err(_) => {}
        }

        // Implicit directory: some key lives below `key/`
        let objects = self.store.list_objects(&self.container).await?;
        objects
            .iter()
            .filter(|o| o.name.starts_with(&marker))
            .map(|o| o.last_modified)
            .max()
            .map(|mod_time| VirtualFile::directory(marker.clone(), mod_time))
            .ok_or_else(|| Error::NotFound(format!("/{key}")))
    }

    async fn rename(&self, ctx: &SessionInfo, from: &str, to: &str) -> Result<()> {
        let src = vfs::file_key(from)?;
        let dst = vfs::file_key(to)?;

        let _guard = self.lock.lock().await;
        self.store.get_metadata(&self.container, &src).await?;
        if src == dst {
            return Ok(());
        }
        self.store.copy_object(&self.container, &src, &dst).await?;

        match self.store.delete_object(&self.container, &src).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(
                    session_id = %ctx.session_id,
                    key = %src,
                    "Rename source already gone after copy"
                );
            }
            Err(e) => {
                warn!(
                    event = "rename_partial",
                    session_id = %ctx.session_id,
                    from = %src,
                    to = %dst,
                    error = %e,
                    "Copied but could not delete source; both names exist"
                );
                return Err(e.into());
            }
        }

        info!(
            event = "rename",
            session_id = %ctx.session_id,
            user = %ctx.username,
            from = %src,
            to = %dst,
            "Renamed object"
        );
        Ok(())
    }

    async fn remove(&self, ctx: &SessionInfo, path: &str) -> Result<()> {
        let key = vfs::file_key(path)?;
        let _guard = self.lock.lock().await;

        match self.store.delete_object(&self.container, &key).await {
            Ok(()) => {
                info!(
                    event = "remove",
                    session_id = %ctx.session_id,
                    user = %ctx.username,
                    key = %key,
                    "Removed object"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    session_id = %ctx.session_id,
                    key = %key,
                    "Remove of absent object treated as success"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl FileReader for ObjectFs {
    async fn open_read(&self, ctx: &SessionInfo, path: &str) -> Result<ReadTransfer> {
        let key = vfs::file_key(path)?;
        let metadata = {
            let _guard = self.lock.lock().await;
            self.store.get_metadata(&self.container, &key).await?
        };

        debug!(
            event = "open_read",
            session_id = %ctx.session_id,
            key = %key,
            size = metadata.size,
            "Opened object for reading"
        );
        Ok(ReadTransfer::new(
            Arc::clone(&self.store),
            self.container.clone(),
            key,
            metadata,
            self.scratch.clone(),
            self.transfer_timeout,
        ))
    }
}

#[async_trait]
impl FileWriter for ObjectFs {
    async fn open_write(&self, ctx: &SessionInfo, path: &str) -> Result<WriteTransfer> {
        let key = vfs::file_key(path)?;
        debug!(
            event = "open_write",
            session_id = %ctx.session_id,
            key = %key,
            "Opened object for writing"
        );
        Ok(WriteTransfer::new(
            Arc::clone(&self.store),
            self.container.clone(),
            key,
            self.scratch.clone(),
        ))
    }
}

#[async_trait]
impl FileCommander for ObjectFs {
    async fn execute(&self, ctx: &SessionInfo, command: Command) -> Result<()> {
        match command {
            Command::Rename { from, to } => self.rename(ctx, &from, &to).await,
            Command::Remove { path } => self.remove(ctx, &path).await,
            // Directories only exist as key prefixes, there is nothing to
            // create or delete. Object stores keep no mode, owner or link
            // metadata either.
            other @ (Command::Mkdir { .. }
            | Command::Rmdir { .. }
            | Command::Setstat { .. }
            | Command::Symlink { .. }) => {
                debug!(
                    session_id = %ctx.session_id,
                    command = other.name(),
                    "Rejecting unsupported command"
                );
                Err(Error::not_supported(other.name()))
            }
        }
    }
}

#[async_trait]
impl FileLister for ObjectFs {
    async fn list(&self, ctx: &SessionInfo, path: &str) -> Result<Vec<VirtualFile>> {
        let key = vfs::path_to_key(path)?;
        let _guard = self.lock.lock().await;

        let objects = self.store.list_objects(&self.container).await?;
        let entries = vfs::children(&key, &objects);

        if entries.is_empty() && !key.is_empty() {
            let dir = self.stat_key(&key).await?;
            if !dir.is_directory {
                return Err(Error::Other(format!("{path} is not a directory")));
            }
        }

        debug!(
            session_id = %ctx.session_id,
            path,
            scanned = objects.len(),
            entries = entries.len(),
            "Listed directory"
        );
        Ok(entries)
    }

    async fn stat(&self, _ctx: &SessionInfo, path: &str) -> Result<VirtualFile> {
        let key = vfs::path_to_key(path)?;
        let _guard = self.lock.lock().await;
        self.stat_key(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_store::MemoryStore;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, ObjectFs, SessionInfo) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_container("c"));
        for name in ["a.txt", "dir/b.txt", "dir/c.txt"] {
            store
                .upload_from_stream("c", name, Box::pin(name.as_bytes()))
                .await
                .unwrap();
        }
        let fs = ObjectFs::new(
            store,
            "c",
            ScratchDir::new(tmp.path()),
            Duration::from_secs(5),
        );
        (tmp, fs, SessionInfo::new("tester", None))
    }

    #[tokio::test]
    async fn test_stat_file_directory_and_root() {
        let (_tmp, fs, ctx) = fixture().await;

        let file = fs.stat(&ctx, "/a.txt").await.unwrap();
        assert!(!file.is_directory);
        assert_eq!(file.size, 5);

        let dir = fs.stat(&ctx, "/dir").await.unwrap();
        assert!(dir.is_directory);
        assert_eq!(dir.key, "dir/");

        assert!(fs.stat(&ctx, "/").await.unwrap().is_directory);
        assert!(matches!(fs.stat(&ctx, "/nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_not_found() {
        let (_tmp, fs, ctx) = fixture().await;
        assert!(matches!(fs.list(&ctx, "/missing").await, Err(Error::NotFound(_))));
        assert!(fs.list(&ctx, "/a.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_commands() {
        let (_tmp, fs, ctx) = fixture().await;
        for command in [
            Command::Mkdir { path: "/x".into() },
            Command::Rmdir { path: "/dir".into() },
            Command::Setstat { path: "/a.txt".into() },
            Command::Symlink {
                link: "/l".into(),
                target: "/a.txt".into(),
            },
        ] {
            let err = fs.execute(&ctx, command).await.unwrap_err();
            assert!(matches!(err, Error::NotSupported(_)));
        }
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_tmp, fs, ctx) = fixture().await;
        let remove = || Command::Remove {
            path: "/a.txt".into(),
        };
        fs.execute(&ctx, remove()).await.unwrap();
        fs.execute(&ctx, remove()).await.unwrap();
        assert!(fs.stat(&ctx, "/a.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_missing_source_leaves_destination_absent() {
        let (_tmp, fs, ctx) = fixture().await;
        let err = fs
            .execute(
                &ctx,
                Command::Rename {
                    from: "/ghost".into(),
                    to: "/dest".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(fs.stat(&ctx, "/dest").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_onto_itself_requires_source() {
        let (_tmp, fs, ctx) = fixture().await;
        let onto_itself = |path: &str| Command::Rename {
            from: path.into(),
            to: path.into(),
        };

        let err = fs.execute(&ctx, onto_itself("/ghost")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        fs.execute(&ctx, onto_itself("/a.txt")).await.unwrap();
        assert_eq!(fs.stat(&ctx, "/a.txt").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_open_read_missing_fails() {
        let (_tmp, fs, ctx) = fixture().await;
        assert!(matches!(
            fs.open_read(&ctx, "/nope").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            fs.open_write(&ctx, "/.cirrus-tmp/x").await,
            Err(Error::InvalidPath(_))
        ));
    }
}
