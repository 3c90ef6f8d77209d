//! Transfer engine
//!
//! Bridges SFTP's offset-addressed reads and writes to an object store that
//! only streams whole objects. Each open file handle owns one transfer and
//! each transfer owns at most one scratch file.

mod read;
mod write;

pub use read::ReadTransfer;
pub use write::WriteTransfer;

use crate::session::SessionInfo;
use crate::Result;

/// Per-handle transfer state
pub enum Transfer {
    /// Object being downloaded for reading
    Read(ReadTransfer),
    /// Object being buffered for upload
    Write(WriteTransfer),
}

impl Transfer {
    /// Object key this transfer addresses
    pub fn key(&self) -> &str {
        match self {
            Transfer::Read(t) => t.key(),
            Transfer::Write(t) => t.key(),
        }
    }

    /// Finish the transfer, removing its scratch file
    ///
    /// Reads close immediately; writes block until the upload outcome is known.
    ///
    /// # Errors
    ///
    /// Returns the upload error of a write transfer
    pub async fn close(self, ctx: &SessionInfo) -> Result<()> {
        match self {
            Transfer::Read(t) => {
                t.close(ctx);
                Ok(())
            }
            Transfer::Write(t) => t.close(ctx).await.map(|_| ()),
        }
    }
}
