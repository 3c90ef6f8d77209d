//! Shared fixtures for gateway integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cirrus_sftp::{ObjectFs, ScratchDir, SessionInfo};
use cirrus_store::{
    ByteStream, ContainerInfo, MemoryStore, ObjectInfo, ObjectMetadata, ObjectStore, Result,
    StoreError,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};

/// Container every fixture serves
pub const CONTAINER: &str = "uploads";

/// Session context for adapter calls
pub fn session() -> SessionInfo {
    let peer: SocketAddr = "192.0.2.10:40022".parse().unwrap();
    SessionInfo::new("alice", Some(peer))
}

/// Adapter over `store` with scratch files in `scratch`
pub fn object_fs(store: Arc<dyn ObjectStore>, scratch: &Path, timeout: Duration) -> ObjectFs {
    ObjectFs::new(store, CONTAINER, ScratchDir::new(scratch), timeout)
}

/// Memory store with the fixture container, plus a scratch directory
pub fn memory_fixture() -> (TempDir, Arc<MemoryStore>) {
    (TempDir::new().unwrap(), Arc::new(MemoryStore::with_container(CONTAINER)))
}

/// Names of the files currently in a scratch directory
pub fn scratch_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Store whose server-side copy always fails
///
/// Models an interruption after the temporary object was uploaded but
/// before it was copied onto the final name.
pub struct FailingCopyStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl ObjectStore for FailingCopyStore {
    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list_objects(container).await
    }

    async fn get_metadata(&self, container: &str, name: &str) -> Result<ObjectMetadata> {
        self.inner.get_metadata(container, name).await
    }

    async fn open_download_stream(&self, container: &str, name: &str) -> Result<ByteStream> {
        self.inner.open_download_stream(container, name).await
    }

    async fn upload_from_stream(&self, container: &str, name: &str, body: ByteStream) -> Result<u64> {
        self.inner.upload_from_stream(container, name, body).await
    }

    async fn copy_object(&self, _container: &str, _src: &str, _dst: &str) -> Result<()> {
        Err(StoreError::Backend("copy interrupted".to_string()))
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        self.inner.delete_object(container, name).await
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        self.inner.container_exists(container).await
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        self.inner.create_container(container).await
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        self.inner.delete_container(container).await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.inner.list_containers().await
    }
}

/// Store whose downloads deliver a prefix of the body and then stall
///
/// The writing half of every download pipe is parked here so the reader
/// never sees end of stream.
pub struct StallingStore {
    pub inner: MemoryStore,
    pub prefix: usize,
    parked: Mutex<Vec<DuplexStream>>,
}

impl StallingStore {
    pub fn new(inner: MemoryStore, prefix: usize) -> Self {
        Self {
            inner,
            prefix,
            parked: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ObjectStore for StallingStore {
    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list_objects(container).await
    }

    async fn get_metadata(&self, container: &str, name: &str) -> Result<ObjectMetadata> {
        self.inner.get_metadata(container, name).await
    }

    async fn open_download_stream(&self, container: &str, name: &str) -> Result<ByteStream> {
        let mut body = Vec::new();
        let mut full = self.inner.open_download_stream(container, name).await?;
        tokio::io::AsyncReadExt::read_to_end(&mut full, &mut body).await?;
        body.truncate(self.prefix);

        let (reader, mut writer) = tokio::io::duplex(body.len().max(1));
        writer.write_all(&body).await?;
        self.parked.lock().unwrap().push(writer);
        Ok(Box::pin(reader))
    }

    async fn upload_from_stream(&self, container: &str, name: &str, body: ByteStream) -> Result<u64> {
        self.inner.upload_from_stream(container, name, body).await
    }

    async fn copy_object(&self, container: &str, src: &str, dst: &str) -> Result<()> {
        self.inner.copy_object(container, src, dst).await
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        self.inner.delete_object(container, name).await
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        self.inner.container_exists(container).await
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        self.inner.create_container(container).await
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        self.inner.delete_container(container).await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.inner.list_containers().await
    }
}

/// Store whose downloads arrive in small pieces with a pause between them
///
/// Every pause is shorter than the transfer timeout, so readers must wait
/// for the producer and then keep going.
pub struct TricklingStore {
    pub inner: MemoryStore,
    pub piece: usize,
    pub pause: Duration,
}

#[async_trait]
impl ObjectStore for TricklingStore {
    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list_objects(container).await
    }

    async fn get_metadata(&self, container: &str, name: &str) -> Result<ObjectMetadata> {
        self.inner.get_metadata(container, name).await
    }

    async fn open_download_stream(&self, container: &str, name: &str) -> Result<ByteStream> {
        let mut body = Vec::new();
        let mut full = self.inner.open_download_stream(container, name).await?;
        tokio::io::AsyncReadExt::read_to_end(&mut full, &mut body).await?;

        let (reader, mut writer) = tokio::io::duplex(self.piece.max(1));
        let piece = self.piece.max(1);
        let pause = self.pause;
        tokio::spawn(async move {
            for part in body.chunks(piece) {
                tokio::time::sleep(pause).await;
                if writer.write_all(part).await.is_err() {
                    return;
                }
            }
        });
        Ok(Box::pin(reader))
    }

    async fn upload_from_stream(&self, container: &str, name: &str, body: ByteStream) -> Result<u64> {
        self.inner.upload_from_stream(container, name, body).await
    }

    async fn copy_object(&self, container: &str, src: &str, dst: &str) -> Result<()> {
        self.inner.copy_object(container, src, dst).await
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        self.inner.delete_object(container, name).await
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        self.inner.container_exists(container).await
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        self.inner.create_container(container).await
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        self.inner.delete_container(container).await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.inner.list_containers().await
    }
}
