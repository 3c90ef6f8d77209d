use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Streaming object body, read front to back exactly once
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// An entry returned by a container listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Full object key
    pub name: String,
    /// Body size in bytes
    pub size: u64,
    /// Time of the last upload or copy onto this key
    pub last_modified: DateTime<Utc>,
}

/// Metadata for a single object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Body size in bytes
    pub size: u64,
    /// Time of the last upload or copy onto this key
    pub last_modified: DateTime<Utc>,
}

/// Summary of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container name
    pub name: String,
    /// Number of objects stored
    pub object_count: u64,
    /// Total bytes across all objects
    pub bytes: u64,
}

impl From<&ObjectInfo> for ObjectMetadata {
    fn from(info: &ObjectInfo) -> Self {
        Self {
            size: info.size,
            last_modified: info.last_modified,
        }
    }
}
