//! SSH server and per-connection handler
//!
//! The server owns process-wide state: the SSH configuration, the object
//! store and the scratch directory. Each accepted connection gets a
//! [`ConnectionHandler`] with its own authenticator, and each SFTP channel
//! gets its own [`SftpHandler`] over an [`ObjectFs`] bound to the
//! authenticated session.

use crate::auth::{AuthorizedKeys, Authenticator, PasswordStore};
use crate::config::{BackendConfig, Config};
use crate::fs::ObjectFs;
use crate::scratch::ScratchDir;
use crate::session::SessionInfo;
use crate::sftp::SftpHandler;
use crate::{Error, Result};
use cirrus_store::{DirectoryStore, MemoryStore, ObjectStore};
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Msg, Server as SshServer, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Subsystem name clients request for SFTP
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// State shared by every connection
struct Shared {
    config: Config,
    store: Arc<dyn ObjectStore>,
    passwords: Option<Arc<PasswordStore>>,
    scratch: ScratchDir,
}

/// SFTP gateway server
pub struct Server {
    shared: Arc<Shared>,
    ssh_config: Arc<russh::server::Config>,
}

impl Server {
    /// Prepare a server over `store`
    ///
    /// Validates the configuration, loads (or generates) the host key, loads
    /// the password file, creates the scratch directory and makes sure the
    /// configured container exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings, an unreadable host key
    /// or a missing container that may not be created, and a backend error if
    /// the store cannot be reached
    pub async fn new(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;

        let host_key = load_or_generate_host_key(&config.host_key_path)?;

        let passwords = match &config.password_file_path {
            Some(path) => {
                let store = PasswordStore::load(path)?;
                info!(
                    path = %path.display(),
                    users = store.len(),
                    "Loaded password file"
                );
                Some(Arc::new(store))
            }
            None => None,
        };

        let scratch = ScratchDir::new(&config.scratch_dir);
        scratch.ensure()?;

        ensure_container(store.as_ref(), &config.container, config.create_container).await?;

        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);
        if passwords.is_some() {
            methods.push(MethodKind::Password);
        }

        let ssh_config = russh::server::Config {
            inactivity_timeout: config.inactivity_timeout(),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods,
            keys: vec![host_key],
            ..Default::default()
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                passwords,
                scratch,
            }),
            ssh_config: Arc::new(ssh_config),
        })
    }

    /// Configuration the server was built with
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Bind the configured address and serve until the listener fails
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the address cannot be bound or the
    /// accept loop stops
    pub async fn run(self) -> Result<()> {
        let addr = self.shared.config.bind_address.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Connection(format!("Failed to bind {addr}: {e}")))?;
        self.run_on(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the accept loop stops
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        info!(
            event = "server_start",
            local_addr = ?listener.local_addr().ok(),
            container = %self.shared.config.container,
            scratch_dir = %self.shared.scratch.path().display(),
            password_auth = self.shared.passwords.is_some(),
            "SFTP gateway listening"
        );

        let mut runner = ServerRunner {
            shared: Arc::clone(&self.shared),
        };
        runner
            .run_on_socket(Arc::clone(&self.ssh_config), &listener)
            .await
            .map_err(|e| Error::Connection(format!("Server error: {e}")))
    }
}

/// Open the object store a backend configuration names
///
/// # Errors
///
/// Returns a backend error if the directory store cannot be opened
pub async fn open_backend(backend: &BackendConfig) -> Result<Arc<dyn ObjectStore>> {
    match backend {
        BackendConfig::Memory => {
            warn!("Using the in-memory backend; objects are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        BackendConfig::Directory { root } => {
            let store = DirectoryStore::open(root).await?;
            info!(root = %root.display(), "Opened directory backend");
            Ok(Arc::new(store))
        }
    }
}

async fn ensure_container(store: &dyn ObjectStore, container: &str, create: bool) -> Result<()> {
    if store.container_exists(container).await? {
        debug!(container, "Container found");
        return Ok(());
    }
    if !create {
        return Err(Error::Config(format!(
            "container {container} does not exist (set create_container to create it)"
        )));
    }
    store.create_container(container).await?;
    info!(container, "Created container");
    Ok(())
}

fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        debug!(path = %path.display(), "Loading host key");
        return PrivateKey::read_openssh_file(path).map_err(|e| {
            Error::Config(format!("Failed to load host key {}: {e}", path.display()))
        });
    }

    warn!(path = %path.display(), "Host key not found, generating Ed25519 key");
    let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Config(format!("Failed to generate host key: {e}")))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    key.write_openssh_file(path, russh::keys::ssh_key::LineEnding::LF)
        .map_err(|e| Error::Config(format!("Failed to write host key {}: {e}", path.display())))?;
    Ok(key)
}

/// Implements the russh server trait; cloned by russh for its accept loop
#[derive(Clone)]
struct ServerRunner {
    shared: Arc<Shared>,
}

impl SshServer for ServerRunner {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(event = "connection_open", peer = ?peer_addr, "New client connection");

        // Reloaded per connection so key changes apply without a restart
        let mut keys = AuthorizedKeys::new(&self.shared.config.authorized_keys_path);
        if let Err(e) = keys.load() {
            warn!(
                path = %self.shared.config.authorized_keys_path.display(),
                error = %e,
                "Failed to load authorized keys; public key authentication will fail"
            );
        }

        ConnectionHandler {
            shared: Arc::clone(&self.shared),
            authenticator: Authenticator::new(keys, self.shared.passwords.clone()),
            peer_addr,
            session: None,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        if error.is_client_error() {
            debug!(error = %error, "Session ended with client error");
        } else {
            error!(error = %error, "Session error");
        }
    }
}

/// Per-connection SSH handler
pub struct ConnectionHandler {
    shared: Arc<Shared>,
    authenticator: Authenticator,
    peer_addr: Option<SocketAddr>,
    session: Option<Arc<SessionInfo>>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    fn rejection(&self) -> Auth {
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);
        if self.authenticator.offers_password() {
            methods.push(MethodKind::Password);
        }
        Auth::Reject {
            proceed_with_methods: Some(methods),
            partial_success: false,
        }
    }

    fn accept(&mut self, session: SessionInfo) -> Auth {
        self.session = Some(Arc::new(session));
        Auth::Accept
    }

    /// Log a refused request and reply with channel failure
    ///
    /// The connection stays up; only the request is refused.
    fn refuse(&self, channel: ChannelId, err: &Error, session: &mut Session) -> Result<()> {
        self.log_refusal(channel, err);
        session.channel_failure(channel)?;
        Ok(())
    }

    fn log_refusal(&self, channel: ChannelId, err: &Error) {
        let session_id = self.session.as_ref().map(|info| info.session_id.to_string());
        if err.is_client_error() {
            warn!(
                event = "request_refused",
                session_id = ?session_id,
                peer = ?self.peer_addr,
                channel = ?channel,
                error = %err,
                "Refused client request"
            );
        } else {
            error!(
                session_id = ?session_id,
                peer = ?self.peer_addr,
                channel = ?channel,
                error = %err,
                "Could not serve request"
            );
        }
    }

    fn new_filesystem(&self) -> ObjectFs {
        ObjectFs::new(
            Arc::clone(&self.shared.store),
            self.shared.config.container.clone(),
            self.shared.scratch.clone(),
            self.shared.config.transfer_timeout(),
        )
    }
}

impl Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        match self
            .authenticator
            .verify_publickey(user, public_key, self.peer_addr)
        {
            Ok(session) => Ok(self.accept(session)),
            Err(_) => Ok(self.rejection()),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        match self
            .authenticator
            .verify_password(user, password, self.peer_addr)
            .await
        {
            Ok(session) => Ok(self.accept(session)),
            Err(_) => Ok(self.rejection()),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!(channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        let err = Error::Protocol(format!(
            "direct-tcpip to {host_to_connect}:{port_to_connect} not permitted"
        ));
        self.log_refusal(channel.id(), &err);
        Ok(false)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name != SFTP_SUBSYSTEM {
            let err = Error::Protocol(format!("unsupported subsystem {name:?}"));
            return self.refuse(channel_id, &err, session);
        }

        let (Some(info), Some(channel)) = (self.session.clone(), self.channels.remove(&channel_id))
        else {
            let err = Error::Protocol("sftp requested on unknown channel".to_string());
            return self.refuse(channel_id, &err, session);
        };

        session.channel_success(channel_id)?;
        info!(
            event = "sftp_start",
            session_id = %info.session_id,
            user = %info.username,
            peer = %info.remote_addr,
            container = %self.shared.config.container,
            "SFTP subsystem started"
        );

        let handler = SftpHandler::new(Arc::new(self.new_filesystem()), info);
        russh_sftp::server::run(channel.into_stream(), handler).await;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        let err = Error::Protocol("shell not permitted".to_string());
        self.refuse(channel, &err, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let err = Error::Protocol(format!(
            "exec not permitted: {}",
            String::from_utf8_lossy(data)
        ));
        self.refuse(channel, &err, session)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        match &self.session {
            Some(info) => info!(
                event = "connection_closed",
                session_id = %info.session_id,
                user = %info.username,
                peer = %info.remote_addr,
                "Connection closed"
            ),
            None => debug!(peer = ?self.peer_addr, "Unauthenticated connection closed"),
        }
    }
}
