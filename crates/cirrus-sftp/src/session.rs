//! Per-connection session context
//!
//! A [`SessionInfo`] is built once, when authentication succeeds, and is
//! passed by reference into every filesystem and transfer call so log lines
//! carry the session fields without any shared logger state.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Authenticated connection context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier
    ///
    /// russh does not expose the SSH exchange hash to handlers, so a random
    /// v4 UUID stands in for it.
    pub session_id: String,
    /// Authenticated user name
    pub username: String,
    /// Remote peer address, `"unknown"` if the transport did not report one
    pub remote_addr: String,
    /// Time authentication completed
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Create a session for a freshly authenticated user
    pub fn new(username: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            username: username.into(),
            remote_addr: remote_addr.map_or_else(|| "unknown".to_string(), |a| a.to_string()),
            started_at: Utc::now(),
        }
    }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} [{}]", self.username, self.remote_addr, self.session_id)
    }
}
