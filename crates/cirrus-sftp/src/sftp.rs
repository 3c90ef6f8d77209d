//! SFTP subsystem handler
//!
//! One [`SftpHandler`] serves one SFTP channel. It owns the channel's open
//! handles and forwards every request to a [`Filesystem`] together with the
//! session context.

use crate::fs::{Command, Filesystem};
use crate::session::SessionInfo;
use crate::transfer::Transfer;
use crate::vfs::{self, VirtualFile};
use crate::{Error, Result};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use russh_sftp::server::Handler;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest read served in one response
const MAX_READ_SIZE: u32 = 256 * 1024;

/// Directory entries returned per READDIR response
const READDIR_BATCH: usize = 100;

const DIR_MODE: u32 = 0o040_755;
const FILE_MODE: u32 = 0o100_644;

const LANGUAGE_TAG: &str = "en-US";

enum OpenHandle {
    File(Transfer),
    Dir { entries: Vec<VirtualFile>, position: usize },
}

/// SFTP request handler for one channel
pub struct SftpHandler<F> {
    fs: Arc<F>,
    session: Arc<SessionInfo>,
    handles: HashMap<String, OpenHandle>,
    handle_counter: u64,
}

impl<F: Filesystem + 'static> SftpHandler<F> {
    /// Create a handler bound to an authenticated session
    pub fn new(fs: Arc<F>, session: Arc<SessionInfo>) -> Self {
        Self {
            fs,
            session,
            handles: HashMap::new(),
            handle_counter: 0,
        }
    }

    fn new_handle(&mut self) -> String {
        self.handle_counter += 1;
        format!("h{}", self.handle_counter)
    }

    fn log_failure(&self, op: &str, err: &Error) {
        let session = &self.session;
        if err.is_security_event() {
            warn!(
                event = "security_event",
                session_id = %session.session_id,
                user = %session.username,
                peer = %session.remote_addr,
                op,
                error = %err,
                "Suspicious request"
            );
        } else if err.is_client_error() {
            debug!(
                session_id = %session.session_id,
                user = %session.username,
                op,
                error = %err,
                "Request rejected"
            );
        } else {
            warn!(
                session_id = %session.session_id,
                user = %session.username,
                op,
                error = %err,
                "Request failed"
            );
        }
    }

    /// Log a failed request and turn it into the client status code
    fn fail(&self, op: &str, err: Error) -> StatusCode {
        self.log_failure(op, &err);
        err.into()
    }

    /// Status reply for requests answered with SSH_FXP_STATUS
    ///
    /// Failures carry [`Error::sanitized_message`] as the status text.
    fn status(&self, id: u32, op: &str, result: Result<()>) -> Status {
        match result {
            Ok(()) => ok_status(id),
            Err(err) => {
                self.log_failure(op, &err);
                Status {
                    id,
                    status_code: err.to_status_code(),
                    error_message: err.sanitized_message(),
                    language_tag: LANGUAGE_TAG.to_string(),
                }
            }
        }
    }

    async fn do_open(&mut self, filename: &str, pflags: OpenFlags) -> Result<String> {
        if pflags.contains(OpenFlags::APPEND) {
            return Err(Error::not_supported("append"));
        }

        let wants_write = pflags.contains(OpenFlags::WRITE)
            || pflags.contains(OpenFlags::CREATE)
            || pflags.contains(OpenFlags::TRUNCATE);

        let transfer = if wants_write {
            Transfer::Write(self.fs.open_write(&self.session, filename).await?)
        } else {
            Transfer::Read(self.fs.open_read(&self.session, filename).await?)
        };

        let handle = self.new_handle();
        debug!(
            session_id = %self.session.session_id,
            handle = %handle,
            key = %transfer.key(),
            write = wants_write,
            "Opened file handle"
        );
        self.handles.insert(handle.clone(), OpenHandle::File(transfer));
        Ok(handle)
    }

    async fn do_read(&mut self, handle: &str, offset: u64, len: u32) -> Result<Vec<u8>> {
        let len = len.min(MAX_READ_SIZE) as usize;
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(Transfer::Read(transfer))) => {
                transfer.read_at(&self.session, offset, len).await
            }
            Some(_) => Err(Error::invalid_handle(format!("{handle} is not open for reading"))),
            None => Err(Error::invalid_handle(handle.to_string())),
        }
    }

    async fn do_write(&mut self, handle: &str, offset: u64, data: &[u8]) -> Result<()> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(Transfer::Write(transfer))) => {
                transfer.write_at(offset, data).await
            }
            Some(_) => Err(Error::invalid_handle(format!("{handle} is not open for writing"))),
            None => Err(Error::invalid_handle(handle.to_string())),
        }
    }

    async fn do_close(&mut self, handle: &str) -> Result<()> {
        match self.handles.remove(handle) {
            Some(OpenHandle::File(transfer)) => transfer.close(&self.session).await,
            Some(OpenHandle::Dir { .. }) => Ok(()),
            None => Err(Error::invalid_handle(handle.to_string())),
        }
    }

    async fn do_opendir(&mut self, path: &str) -> Result<String> {
        let entries = self.fs.list(&self.session, path).await?;
        let handle = self.new_handle();
        self.handles.insert(
            handle.clone(),
            OpenHandle::Dir {
                entries,
                position: 0,
            },
        );
        Ok(handle)
    }

    fn do_readdir(&mut self, handle: &str) -> std::result::Result<Vec<File>, StatusCode> {
        let Some(OpenHandle::Dir { entries, position }) = self.handles.get_mut(handle) else {
            return Err(StatusCode::BadMessage);
        };
        if *position >= entries.len() {
            return Err(StatusCode::Eof);
        }

        let end = (*position + READDIR_BATCH).min(entries.len());
        let files = entries[*position..end]
            .iter()
            .map(|entry| {
                let attrs = attributes(entry);
                File {
                    filename: entry.name().to_string(),
                    longname: longname(entry),
                    attrs,
                }
            })
            .collect();
        *position = end;
        Ok(files)
    }

    fn do_fstat(&self, handle: &str) -> Result<FileAttributes> {
        match self.handles.get(handle) {
            Some(OpenHandle::File(Transfer::Read(t))) => {
                let meta = t.metadata();
                Ok(attributes(&VirtualFile::file(t.key(), meta.size, meta.last_modified)))
            }
            Some(OpenHandle::File(Transfer::Write(t))) => Ok(attributes(&VirtualFile::file(
                t.key(),
                t.size(),
                chrono::Utc::now(),
            ))),
            Some(OpenHandle::Dir { .. }) => Ok(attributes(&VirtualFile::root())),
            None => Err(Error::invalid_handle(handle.to_string())),
        }
    }

    async fn run_command(&self, command: Command) -> Result<()> {
        self.fs.execute(&self.session, command).await
    }
}

impl<F> Drop for SftpHandler<F> {
    fn drop(&mut self) {
        // Open transfers drop here on channel teardown, which aborts their
        // downloads and unlinks their scratch files. Unfinished writes are
        // discarded, never uploaded.
        if !self.handles.is_empty() {
            info!(
                session_id = %self.session.session_id,
                open_handles = self.handles.len(),
                "SFTP channel closed with open handles"
            );
        }
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: LANGUAGE_TAG.to_string(),
    }
}

fn unix_seconds(time: chrono::DateTime<chrono::Utc>) -> u32 {
    u32::try_from(time.timestamp()).unwrap_or(0)
}

/// SFTP attributes for a virtual file
fn attributes(entry: &VirtualFile) -> FileAttributes {
    let mtime = unix_seconds(entry.mod_time);
    FileAttributes {
        size: Some(entry.size),
        uid: Some(0),
        user: None,
        gid: Some(0),
        group: None,
        permissions: Some(if entry.is_directory { DIR_MODE } else { FILE_MODE }),
        atime: Some(mtime),
        mtime: Some(mtime),
    }
}

/// `ls -l` style line for READDIR
fn longname(entry: &VirtualFile) -> String {
    let kind = if entry.is_directory { "drwxr-xr-x" } else { "-rw-r--r--" };
    let date = entry.mod_time.format("%b %e %H:%M");
    format!(
        "{kind}  1 0        0        {size:>10} {date} {name}",
        size = entry.size,
        name = entry.name()
    )
}

impl<F: Filesystem + 'static> Handler for SftpHandler<F> {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> impl Future<Output = std::result::Result<Version, Self::Error>> + Send {
        info!(
            session_id = %self.session.session_id,
            user = %self.session.username,
            version,
            "SFTP session initialized"
        );
        async move { Ok(Version::new()) }
    }

    fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> impl Future<Output = std::result::Result<Handle, Self::Error>> + Send {
        async move {
            match self.do_open(&filename, pflags).await {
                Ok(handle) => Ok(Handle { id, handle }),
                Err(e) => Err(self.fail("open", e)),
            }
        }
    }

    fn close(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let result = self.do_close(&handle).await;
            Ok(self.status(id, "close", result))
        }
    }

    fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> impl Future<Output = std::result::Result<Data, Self::Error>> + Send {
        async move {
            match self.do_read(&handle, offset, len).await {
                Ok(data) if data.is_empty() && len > 0 => Err(StatusCode::Eof),
                Ok(data) => Ok(Data { id, data }),
                Err(e) => Err(self.fail("read", e)),
            }
        }
    }

    fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let result = self.do_write(&handle, offset, &data).await;
            Ok(self.status(id, "write", result))
        }
    }

    fn lstat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = std::result::Result<Attrs, Self::Error>> + Send {
        self.stat(id, path)
    }

    fn fstat(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl Future<Output = std::result::Result<Attrs, Self::Error>> + Send {
        let result = self.do_fstat(&handle).map_err(|e| self.fail("fstat", e));
        async move { result.map(|attrs| Attrs { id, attrs }) }
    }

    fn setstat(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let result = self.run_command(Command::Setstat { path }).await;
            Ok(self.status(id, "setstat", result))
        }
    }

    fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        _attrs: FileAttributes,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        let path = match self.handles.get(&handle) {
            Some(OpenHandle::File(t)) => format!("/{}", t.key()),
            _ => handle,
        };
        async move {
            let result = self.run_command(Command::Setstat { path }).await;
            Ok(self.status(id, "fsetstat", result))
        }
    }

    fn opendir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = std::result::Result<Handle, Self::Error>> + Send {
        async move {
            match self.do_opendir(&path).await {
                Ok(handle) => Ok(Handle { id, handle }),
                Err(e) => Err(self.fail("opendir", e)),
            }
        }
    }

    fn readdir(
        &mut self,
        id: u32,
        handle: String,
    ) -> impl Future<Output = std::result::Result<Name, Self::Error>> + Send {
        let result = self.do_readdir(&handle);
        async move { result.map(|files| Name { id, files }) }
    }

    fn remove(
        &mut self,
        id: u32,
        filename: String,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let result = self.run_command(Command::Remove { path: filename }).await;
            Ok(self.status(id, "remove", result))
        }
    }

    fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let result = self.run_command(Command::Mkdir { path }).await;
            Ok(self.status(id, "mkdir", result))
        }
    }

    fn rmdir(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let result = self.run_command(Command::Rmdir { path }).await;
            Ok(self.status(id, "rmdir", result))
        }
    }

    fn realpath(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = std::result::Result<Name, Self::Error>> + Send {
        let resolved = vfs::normalize(&path);
        debug!(requested = %path, resolved = %resolved, "Resolved real path");
        async move {
            Ok(Name {
                id,
                files: vec![File {
                    filename: resolved,
                    longname: String::new(),
                    attrs: FileAttributes::default(),
                }],
            })
        }
    }

    fn stat(
        &mut self,
        id: u32,
        path: String,
    ) -> impl Future<Output = std::result::Result<Attrs, Self::Error>> + Send {
        async move {
            match self.fs.stat(&self.session, &path).await {
                Ok(entry) => Ok(Attrs {
                    id,
                    attrs: attributes(&entry),
                }),
                Err(e) => Err(self.fail("stat", e)),
            }
        }
    }

    fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let command = Command::Rename {
                from: oldpath,
                to: newpath,
            };
            let result = self.run_command(command).await;
            Ok(self.status(id, "rename", result))
        }
    }

    fn readlink(
        &mut self,
        _id: u32,
        path: String,
    ) -> impl Future<Output = std::result::Result<Name, Self::Error>> + Send {
        debug!(path = %path, "Rejecting readlink");
        async move { Err(StatusCode::OpUnsupported) }
    }

    fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> impl Future<Output = std::result::Result<Status, Self::Error>> + Send {
        async move {
            let command = Command::Symlink {
                link: linkpath,
                target: targetpath,
            };
            let result = self.run_command(command).await;
            Ok(self.status(id, "symlink", result))
        }
    }
}
