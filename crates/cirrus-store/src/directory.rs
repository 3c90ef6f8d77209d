//! Local directory backend
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<container>/<encoded object name>
//! <root>/<container>/<segment>%/<segment>%/%<tail>
//! <root>/.staging/<uuid>
//! ```
//!
//! Object names are percent-encoded into a single file name so the namespace
//! stays flat. Encoded names longer than [`SEGMENT_MAX`] bytes are cut into
//! segments: every segment but the last becomes a directory whose name ends
//! in a bare `%`, and the last is a file whose name starts with one. Neither
//! form can be produced by the encoder, so split and unsplit names never
//! collide. Uploads land in `.staging` first and are renamed into the
//! container once the body has been fully received.

use crate::{
    ByteStream, ContainerInfo, ObjectInfo, ObjectMetadata, ObjectStore, Result, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";

/// Longest single path component written, below the common 255 byte limit
const SEGMENT_MAX: usize = 200;

const SEGMENT_MARK: char = '%';

/// Object store backed by a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        validate_container_name(container)?;
        Ok(self.root.join(container))
    }

    fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(StoreError::InvalidName("empty object name".into()));
        }
        Ok(self.container_dir(container)?.join(segment_path(&encode_name(name))))
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string())
    }

    async fn require_container(&self, container: &str) -> Result<PathBuf> {
        let dir = self.container_dir(container)?;
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StoreError::ContainerNotFound(container.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::ContainerNotFound(container.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a fully written staging file onto its object path
    async fn publish(&self, staged: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                let _ = fs::remove_file(staged).await;
                return Err(e.into());
            }
        }
        if let Err(e) = fs::rename(staged, target).await {
            let _ = fs::remove_file(staged).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn validate_container_name(container: &str) -> Result<()> {
    if container.is_empty()
        || container.starts_with('.')
        || container.contains(['/', '\\'])
    {
        return Err(StoreError::InvalidName(container.to_string()));
    }
    Ok(())
}

/// Percent-encode an object name into one file name
///
/// `%` and `/` are always escaped; a leading `.` is escaped so names like
/// `..` cannot address anything outside the container directory.
pub(crate) fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.chars().enumerate() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '.' if i == 0 => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

/// Relative path for an encoded name, split into segments when too long
fn segment_path(encoded: &str) -> PathBuf {
    if encoded.len() <= SEGMENT_MAX {
        return PathBuf::from(encoded);
    }

    let mut path = PathBuf::new();
    let mut rest = encoded;
    while rest.len() > SEGMENT_MAX {
        let mut cut = SEGMENT_MAX;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        path.push(format!("{head}{SEGMENT_MARK}"));
        rest = tail;
    }
    path.push(format!("{SEGMENT_MARK}{rest}"));
    path
}

/// Reverse of [`encode_name`]; returns `None` for names this store never writes
pub(crate) fn decode_name(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn not_found_or(err: std::io::Error, container: &str, name: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::not_found(container, name)
    } else {
        StoreError::Io(err)
    }
}

fn modified_at(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ObjectStore for DirectoryStore {
    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.require_container(container).await?;
        let mut objects = Vec::new();
        // (directory, encoded prefix carried by its segment directories)
        let mut pending = vec![(dir, String::new())];

        while let Some((current, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name();
                let meta = entry.metadata().await?;
                let Some(segment) = file_name.to_str() else {
                    warn!(container, file = ?file_name, "Skipping non UTF-8 entry");
                    continue;
                };

                if meta.is_dir() {
                    if let Some(head) = segment.strip_suffix(SEGMENT_MARK) {
                        pending.push((entry.path(), format!("{prefix}{head}")));
                    }
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }

                let encoded = if prefix.is_empty() {
                    Some(segment.to_string())
                } else {
                    segment
                        .strip_prefix(SEGMENT_MARK)
                        .map(|tail| format!("{prefix}{tail}"))
                };
                let Some(name) = encoded.as_deref().and_then(decode_name) else {
                    warn!(
                        container,
                        file = ?entry.path(),
                        "Skipping file with undecodable object name"
                    );
                    continue;
                };
                objects.push(ObjectInfo {
                    name,
                    size: meta.len(),
                    last_modified: modified_at(&meta),
                });
            }
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn get_metadata(&self, container: &str, name: &str) -> Result<ObjectMetadata> {
        self.require_container(container).await?;
        let path = self.object_path(container, name)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or(e, container, name))?;
        if !meta.is_file() {
            return Err(StoreError::not_found(container, name));
        }
        Ok(ObjectMetadata {
            size: meta.len(),
            last_modified: modified_at(&meta),
        })
    }

    async fn open_download_stream(&self, container: &str, name: &str) -> Result<ByteStream> {
        self.require_container(container).await?;
        let path = self.object_path(container, name)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or(e, container, name))?;
        Ok(Box::pin(file))
    }

    async fn upload_from_stream(
        &self,
        container: &str,
        name: &str,
        mut body: ByteStream,
    ) -> Result<u64> {
        self.require_container(container).await?;
        let target = self.object_path(container, name)?;
        let staged = self.staging_path();

        let received = async {
            let mut file = fs::File::create(&staged).await?;
            let size = tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, std::io::Error>(size)
        }
        .await;

        let size = match received {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&staged).await;
                return Err(e.into());
            }
        };

        self.publish(&staged, &target).await?;
        debug!(container, name, size, "Stored object on disk");
        Ok(size)
    }

    async fn copy_object(&self, container: &str, src: &str, dst: &str) -> Result<()> {
        self.require_container(container).await?;
        let source = self.object_path(container, src)?;
        let target = self.object_path(container, dst)?;
        let staged = self.staging_path();

        if let Err(e) = fs::copy(&source, &staged).await {
            let _ = fs::remove_file(&staged).await;
            return Err(not_found_or(e, container, src));
        }
        self.publish(&staged, &target).await
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        let dir = self.require_container(container).await?;
        let path = self.object_path(container, name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(e, container, name))?;

        // Drop segment directories the object leaves empty
        let mut parent = path.parent();
        while let Some(segment) = parent.filter(|p| *p != dir.as_path()) {
            if fs::remove_dir(segment).await.is_err() {
                break;
            }
            parent = segment.parent();
        }
        Ok(())
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        match self.require_container(container).await {
            Ok(_) => Ok(true),
            Err(StoreError::ContainerNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        let dir = self.container_dir(container)?;
        fs::create_dir_all(&dir).await?;
        debug!(container, path = %dir.display(), "Container ready");
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        let dir = self.require_container(container).await?;
        fs::remove_dir_all(&dir).await?;
        debug!(container, "Container deleted");
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => names.push(name.to_string()),
                _ => {}
            }
        }
        names.sort();

        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            let objects = self.list_objects(&name).await?;
            infos.push(ContainerInfo {
                object_count: objects.len() as u64,
                bytes: objects.iter().map(|o| o.size).sum(),
                name,
            });
        }
        Ok(infos)
    }
}
