//! # Cirrus Store
//!
//! Object storage collaborator for the Cirrus SFTP gateway.
//!
//! The gateway only ever talks to storage through [`ObjectStore`]: a flat,
//! container-scoped namespace with whole-object streaming. There are no
//! directories, no ranged writes and no atomic rename.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: in-process map, used by tests and ephemeral runs
//! - [`DirectoryStore`]: a local directory standing in for the object service

pub mod directory;
pub mod error;
pub mod memory;
pub mod types;

pub use directory::DirectoryStore;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use types::{ByteStream, ContainerInfo, ObjectInfo, ObjectMetadata};

use async_trait::async_trait;

/// Operations the gateway consumes from an object storage service
///
/// Every call is a single attempt. Retry policy, if any, belongs to a
/// wrapper implementing this same trait.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every object in the container, sorted by name
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ContainerNotFound`] if the container is missing
    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>>;

    /// Fetch size and modification time of one object
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the object is missing
    async fn get_metadata(&self, container: &str, name: &str) -> Result<ObjectMetadata>;

    /// Open a stream over the full object body
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the object is missing
    async fn open_download_stream(&self, container: &str, name: &str) -> Result<ByteStream>;

    /// Create or replace an object from a stream, returning the stored size
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or the backend rejects the body
    async fn upload_from_stream(
        &self,
        container: &str,
        name: &str,
        body: ByteStream,
    ) -> Result<u64>;

    /// Server-side copy of `src` onto `dst`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `src` is missing
    async fn copy_object(&self, container: &str, src: &str, dst: &str) -> Result<()>;

    /// Delete one object
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the object is missing
    async fn delete_object(&self, container: &str, name: &str) -> Result<()>;

    /// Check whether a container exists
    async fn container_exists(&self, container: &str) -> Result<bool>;

    /// Create a container; creating an existing container is not an error
    async fn create_container(&self, container: &str) -> Result<()>;

    /// Delete every object in the container, then the container itself
    async fn delete_container(&self, container: &str) -> Result<()>;

    /// Summaries of all containers
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
}
