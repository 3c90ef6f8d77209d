//! Write transfers
//!
//! `Idle -> Buffering -> Uploading -> {Done, Failed}`
//!
//! Writes land at their offsets in a private scratch file. On close the file
//! is uploaded under a temporary key, copied onto the final key, and the
//! temporary object is deleted on every path. The final key therefore only
//! ever holds a complete body.

use crate::scratch::{ScratchDir, ScratchFile};
use crate::session::SessionInfo;
use crate::vfs::TEMP_PREFIX;
use crate::{Error, Result};
use cirrus_store::ObjectStore;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Buffer {
    scratch: ScratchFile,
    file: File,
}

/// Offset-addressed writer producing one object on close
pub struct WriteTransfer {
    store: Arc<dyn ObjectStore>,
    container: String,
    key: String,
    scratch_dir: ScratchDir,
    buffer: Option<Buffer>,
    extent: u64,
}

impl WriteTransfer {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        container: String,
        key: String,
        scratch_dir: ScratchDir,
    ) -> Self {
        Self {
            store,
            container,
            key,
            scratch_dir,
            buffer: None,
            extent: 0,
        }
    }

    /// Final object key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current size of the buffered body (highest byte written + 1)
    pub fn size(&self) -> u64 {
        self.extent
    }

    /// Scratch file backing this transfer, once the first write created it
    pub fn scratch_path(&self) -> Option<&std::path::Path> {
        self.buffer.as_ref().map(|b| b.scratch.path())
    }

    /// Write `data` at `offset`
    ///
    /// Out-of-order and sparse writes behave like a local file. A zero-length
    /// write still counts as a write, so the handle will produce an object.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the scratch file
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.buffer.is_none() {
            let scratch = self.scratch_dir.allocate()?;
            let file = scratch.handle()?;
            self.buffer = Some(Buffer { scratch, file });
        }
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(Error::Other("write buffer missing".into()));
        };

        buffer.file.seek(SeekFrom::Start(offset)).await?;
        buffer.file.write_all(data).await?;
        self.extent = self.extent.max(offset + data.len() as u64);
        Ok(())
    }

    /// Upload the buffered body and wait for the outcome
    ///
    /// A handle that was never written to is closed without touching the
    /// store. The scratch file is removed whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first backend error of the upload or copy step
    pub async fn close(self, ctx: &SessionInfo) -> Result<u64> {
        let Some(Buffer { scratch, mut file }) = self.buffer else {
            debug!(
                event = "write_noop",
                session_id = %ctx.session_id,
                key = %self.key,
                "Write handle closed without data"
            );
            return Ok(0);
        };

        let flushed = file.flush().await;
        drop(file);

        let result = match flushed {
            Ok(()) => {
                upload(
                    self.store.as_ref(),
                    &self.container,
                    &self.key,
                    &scratch,
                    ctx,
                )
                .await
            }
            Err(e) => Err(e.into()),
        };
        scratch.remove();

        match &result {
            Ok(bytes) => info!(
                event = "upload_complete",
                session_id = %ctx.session_id,
                user = %ctx.username,
                key = %self.key,
                bytes,
                "Object written"
            ),
            Err(e) => warn!(
                event = "upload_failed",
                session_id = %ctx.session_id,
                user = %ctx.username,
                key = %self.key,
                error = %e,
                "Object write failed"
            ),
        }
        result
    }
}

async fn upload(
    store: &dyn ObjectStore,
    container: &str,
    key: &str,
    scratch: &ScratchFile,
    ctx: &SessionInfo,
) -> Result<u64> {
    let temp_key = format!("{TEMP_PREFIX}{}", Uuid::new_v4());
    debug!(
        event = "upload_start",
        session_id = %ctx.session_id,
        key,
        temp_key = %temp_key,
        "Uploading scratch file"
    );

    let staged = async {
        let body = scratch.open_read().await?;
        let bytes = store
            .upload_from_stream(container, &temp_key, Box::pin(body))
            .await?;
        store.copy_object(container, &temp_key, key).await?;
        Ok::<u64, Error>(bytes)
    }
    .await;

    match store.delete_object(container, &temp_key).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(
            event = "temp_cleanup_failed",
            session_id = %ctx.session_id,
            temp_key = %temp_key,
            error = %e,
            "Failed to delete temporary upload object"
        ),
    }

    staged
}
