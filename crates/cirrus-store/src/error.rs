//! Error types for object storage operations

use thiserror::Error;

/// Result type alias for object storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Object storage error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object does not exist in the container
    #[error("Object not found: {container}/{name}")]
    NotFound {
        /// Container that was searched
        container: String,
        /// Object name that was requested
        name: String,
    },

    /// Container does not exist
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Object or container name rejected by the backend
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Local I/O failure while talking to the backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other backend failure (network, storage auth, quota)
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create an object-not-found error
    pub fn not_found(container: impl Into<String>, name: impl Into<String>) -> Self {
        StoreError::NotFound {
            container: container.into(),
            name: name.into(),
        }
    }

    /// Check if the error means the object or container is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::ContainerNotFound(_)
        )
    }
}
