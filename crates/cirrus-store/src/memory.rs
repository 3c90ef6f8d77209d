//! In-memory object store

use crate::{
    ByteStream, ContainerInfo, ObjectInfo, ObjectMetadata, ObjectStore, Result, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone)]
struct StoredObject {
    body: Arc<Vec<u8>>,
    last_modified: DateTime<Utc>,
}

type Containers = HashMap<String, BTreeMap<String, StoredObject>>;

/// Object store held entirely in process memory
///
/// Cloning shares the underlying containers.
#[derive(Clone, Default)]
pub struct MemoryStore {
    containers: Arc<RwLock<Containers>>,
}

impl MemoryStore {
    /// Create an empty store with no containers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with one empty container already present
    pub fn with_container(container: &str) -> Self {
        let mut containers = HashMap::new();
        containers.insert(container.to_string(), BTreeMap::new());
        Self {
            containers: Arc::new(RwLock::new(containers)),
        }
    }
}

fn metadata_of(object: &StoredObject) -> ObjectMetadata {
    ObjectMetadata {
        size: object.body.len() as u64,
        last_modified: object.last_modified,
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        let containers = self.containers.read().await;
        let objects = containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;

        Ok(objects
            .iter()
            .map(|(name, object)| ObjectInfo {
                name: name.clone(),
                size: object.body.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn get_metadata(&self, container: &str, name: &str) -> Result<ObjectMetadata> {
        let containers = self.containers.read().await;
        containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?
            .get(name)
            .map(metadata_of)
            .ok_or_else(|| StoreError::not_found(container, name))
    }

    async fn open_download_stream(&self, container: &str, name: &str) -> Result<ByteStream> {
        let containers = self.containers.read().await;
        let object = containers
            .get(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?
            .get(name)
            .ok_or_else(|| StoreError::not_found(container, name))?;

        Ok(Box::pin(Cursor::new(object.body.as_ref().clone())))
    }

    async fn upload_from_stream(
        &self,
        container: &str,
        name: &str,
        mut body: ByteStream,
    ) -> Result<u64> {
        if name.is_empty() {
            return Err(StoreError::InvalidName("empty object name".into()));
        }

        // Drain the stream before touching the map so a failed body leaves
        // any previous object intact.
        let mut buffer = Vec::new();
        body.read_to_end(&mut buffer).await?;
        let size = buffer.len() as u64;

        let mut containers = self.containers.write().await;
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        objects.insert(
            name.to_string(),
            StoredObject {
                body: Arc::new(buffer),
                last_modified: Utc::now(),
            },
        );

        debug!(container, name, size, "Stored object in memory");
        Ok(size)
    }

    async fn copy_object(&self, container: &str, src: &str, dst: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?;
        let body = objects
            .get(src)
            .map(|object| Arc::clone(&object.body))
            .ok_or_else(|| StoreError::not_found(container, src))?;

        objects.insert(
            dst.to_string(),
            StoredObject {
                body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        containers
            .get_mut(container)
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(container, name))
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        Ok(self.containers.read().await.contains_key(container))
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        if container.is_empty() || container.contains('/') {
            return Err(StoreError::InvalidName(container.to_string()));
        }
        self.containers
            .write()
            .await
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        self.containers
            .write()
            .await
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| StoreError::ContainerNotFound(container.to_string()))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let containers = self.containers.read().await;
        let mut infos: Vec<ContainerInfo> = containers
            .iter()
            .map(|(name, objects)| ContainerInfo {
                name: name.clone(),
                object_count: objects.len() as u64,
                bytes: objects.values().map(|o| o.body.len() as u64).sum(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}
