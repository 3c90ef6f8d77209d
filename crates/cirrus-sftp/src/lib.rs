//! # Cirrus SFTP
//!
//! SFTP gateway over flat object storage.
//!
//! Clients speak SFTP over SSH; every path maps to an object key in one
//! configured container. Directories are synthesised from `/` in keys and
//! file handles are backed by local scratch files, so offset-addressed
//! reads and writes work against a store that only streams whole objects.
//!
//! ## Layers
//!
//! - [`server`]: SSH listener, authentication, subsystem dispatch
//! - [`sftp`]: SFTP request handling and handle table
//! - [`fs`]: filesystem adapter over an [`cirrus_store::ObjectStore`]
//! - [`transfer`]: read and write transfers over scratch files
//! - [`vfs`]: path to key mapping and directory synthesis

pub mod auth;
pub mod config;
pub mod error;
pub mod fs;
pub mod scratch;
pub mod server;
pub mod session;
pub mod sftp;
pub mod transfer;
pub mod vfs;

pub use auth::{hash_password, Authenticator, AuthorizedKeys, PasswordStore};
pub use config::{BackendConfig, Config, LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use fs::{Command, FileCommander, FileLister, FileReader, FileWriter, Filesystem, ObjectFs};
pub use scratch::{ScratchDir, ScratchFile};
pub use server::{open_backend, Server};
pub use session::SessionInfo;
pub use sftp::SftpHandler;
pub use transfer::{ReadTransfer, Transfer, WriteTransfer};
pub use vfs::VirtualFile;
