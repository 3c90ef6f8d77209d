//! Read transfers
//!
//! `Idle -> Downloading -> {Ready, Failed}`
//!
//! The first `read_at` allocates a scratch file and starts a task that streams
//! the whole object into it. Readers serve offsets from the scratch file and,
//! when they catch up with the producer, wait on the task's progress channel
//! instead of reporting end of file. EOF is only returned once the download
//! has completed and the file is exhausted at the requested offset.

use crate::scratch::{ScratchDir, ScratchFile};
use crate::session::SessionInfo;
use crate::{Error, Result};
use cirrus_store::{ObjectMetadata, ObjectStore};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Download state published by the background task
#[derive(Debug, Clone, Default)]
struct Progress {
    /// Bytes flushed to the scratch file so far
    written: u64,
    /// Set exactly once, when the task finishes
    outcome: Option<std::result::Result<u64, Failure>>,
}

/// Why a download stopped
#[derive(Debug, Clone)]
enum Failure {
    /// The object went away after the handle was opened
    Missing(String),
    Other(String),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(message) => Failure::Missing(message),
            other => Failure::Other(other.to_string()),
        }
    }
}

struct Download {
    scratch: Option<ScratchFile>,
    reader: File,
    progress: watch::Receiver<Progress>,
    task: JoinHandle<()>,
}

impl Drop for Download {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(scratch) = self.scratch.take() {
            scratch.remove();
        }
    }
}

/// Offset-addressed reader over one object
pub struct ReadTransfer {
    store: Arc<dyn ObjectStore>,
    container: String,
    key: String,
    metadata: ObjectMetadata,
    scratch_dir: ScratchDir,
    timeout: Duration,
    download: Option<Download>,
}

impl ReadTransfer {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        container: String,
        key: String,
        metadata: ObjectMetadata,
        scratch_dir: ScratchDir,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            container,
            key,
            metadata,
            scratch_dir,
            timeout,
            download: None,
        }
    }

    /// Object key being read
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Object metadata captured when the handle was opened
    pub fn metadata(&self) -> ObjectMetadata {
        self.metadata
    }

    /// Scratch file backing this transfer, once the first read started it
    pub fn scratch_path(&self) -> Option<&std::path::Path> {
        self.download
            .as_ref()
            .and_then(|d| d.scratch.as_ref())
            .map(ScratchFile::path)
    }

    /// Read up to `len` bytes at `offset`
    ///
    /// An empty buffer means end of file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the download makes no progress within the
    /// transfer timeout, or the download's own error if it failed
    pub async fn read_at(
        &mut self,
        ctx: &SessionInfo,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        if self.download.is_none() {
            self.download = Some(self.start(ctx).await?);
        }
        let timeout = self.timeout;
        let key = self.key.clone();
        let Some(download) = self.download.as_mut() else {
            return Err(Error::Other("download state missing".into()));
        };

        loop {
            let chunk = read_chunk(&mut download.reader, offset, len).await?;
            if !chunk.is_empty() || len == 0 {
                return Ok(chunk);
            }

            let progress = download.progress.borrow_and_update().clone();
            match progress.outcome {
                Some(Ok(_)) => {
                    // The producer may have flushed its last bytes between
                    // our read and the completion signal.
                    return read_chunk(&mut download.reader, offset, len).await;
                }
                Some(Err(Failure::Missing(message))) => {
                    return Err(Error::NotFound(format!("{key} removed during download: {message}")));
                }
                Some(Err(Failure::Other(message))) => {
                    return Err(Error::Backend(format!("download of {key} failed: {message}")));
                }
                None if progress.written > offset => continue,
                None => {}
            }

            match tokio::time::timeout(timeout, download.progress.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(Error::Backend(format!(
                        "download of {key} ended without a result"
                    )));
                }
                Err(_) => {
                    warn!(
                        event = "download_timeout",
                        session_id = %ctx.session_id,
                        user = %ctx.username,
                        key = %key,
                        offset,
                        written = progress.written,
                        timeout_secs = timeout.as_secs(),
                        "Read waited too long for download progress"
                    );
                    return Err(Error::timeout(format!(
                        "no download progress for {key} within {}s",
                        timeout.as_secs()
                    )));
                }
            }
        }
    }

    async fn start(&self, ctx: &SessionInfo) -> Result<Download> {
        let scratch = self.scratch_dir.allocate()?;
        let writer = scratch.handle()?;
        let reader = scratch.open_read().await?;
        let (tx, rx) = watch::channel(Progress::default());

        debug!(
            event = "download_start",
            session_id = %ctx.session_id,
            key = %self.key,
            scratch = %scratch.path().display(),
            "Starting background download"
        );

        let task = tokio::spawn(download(
            Arc::clone(&self.store),
            self.container.clone(),
            self.key.clone(),
            writer,
            tx,
            ctx.session_id.clone(),
        ));

        Ok(Download {
            scratch: Some(scratch),
            reader,
            progress: rx,
            task,
        })
    }

    /// Stop any download and remove the scratch file without waiting
    pub fn close(self, ctx: &SessionInfo) {
        // Dropping the download aborts the task and unlinks the scratch file
        drop(self.download);
        debug!(
            event = "read_closed",
            session_id = %ctx.session_id,
            key = %self.key,
            "Read transfer closed"
        );
    }
}

async fn read_chunk(reader: &mut File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.seek(SeekFrom::Start(offset)).await?;

    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

async fn download(
    store: Arc<dyn ObjectStore>,
    container: String,
    key: String,
    mut file: File,
    tx: watch::Sender<Progress>,
    session_id: String,
) {
    let result = async {
        let mut stream = store.open_download_stream(&container, &key).await?;
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let mut written = 0u64;

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            file.flush().await?;
            written += n as u64;
            tx.send_modify(|p| p.written = written);
        }
        Ok::<u64, Error>(written)
    }
    .await;

    match &result {
        Ok(bytes) => debug!(
            event = "download_complete",
            session_id = %session_id,
            key = %key,
            bytes,
            "Background download complete"
        ),
        Err(e) => warn!(
            event = "download_failed",
            session_id = %session_id,
            key = %key,
            error = %e,
            "Background download failed"
        ),
    }

    tx.send_modify(|p| p.outcome = Some(result.map_err(Failure::from)));
}
