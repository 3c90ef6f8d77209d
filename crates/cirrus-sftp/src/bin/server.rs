//! Cirrus SFTP gateway binary
//!
//! Run with: cargo run --bin cirrus-sftp -- server --config cirrus.toml

use anyhow::{bail, Context, Result};
use cirrus_sftp::{hash_password, open_backend, BackendConfig, Config, LogFormat, Server};
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SFTP gateway over object storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SFTP gateway
    Server(ServerArgs),

    /// Hash a password read from stdin for the password file
    HashPassword {
        /// User the entry is for
        username: String,

        /// Print a complete `username:hash` line
        #[arg(long)]
        format: bool,
    },

    /// Manage containers on the configured backend
    Container {
        #[command(flatten)]
        backend: BackendArgs,

        #[command(subcommand)]
        action: ContainerAction,
    },
}

#[derive(Subcommand, Debug)]
enum ContainerAction {
    /// List containers with object counts
    List,
    /// Create a container
    Create {
        /// Container name
        name: String,
    },
    /// Delete a container and every object in it
    Delete {
        /// Container name
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Flags shared by every command that touches the backend
#[derive(Args, Debug)]
struct BackendArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve objects from this directory
    #[arg(long, conflicts_with = "memory")]
    objects_root: Option<PathBuf>,

    /// Keep objects in memory (lost on exit)
    #[arg(long)]
    memory: bool,
}

#[derive(Args, Debug)]
struct ServerArgs {
    #[command(flatten)]
    backend: BackendArgs,

    /// Listener address (host:port)
    #[arg(short, long)]
    bind: Option<String>,

    /// Container to serve
    #[arg(long)]
    container: Option<String>,

    /// Create the container if it does not exist
    #[arg(long)]
    create_container: bool,

    /// Host key path
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// Authorized keys file
    #[arg(long)]
    authorized_keys: Option<PathBuf>,

    /// Password file (`username:hash` lines)
    #[arg(long)]
    password_file: Option<PathBuf>,

    /// Scratch file directory
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Seconds a read may wait on a stalled download
    #[arg(long)]
    transfer_timeout: Option<u64>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl BackendArgs {
    fn load(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => Config::default(),
        };

        if self.memory {
            config.backend = BackendConfig::Memory;
        }
        if let Some(root) = &self.objects_root {
            config.backend = BackendConfig::Directory { root: root.clone() };
        }
        Ok(config)
    }
}

impl ServerArgs {
    fn into_config(self) -> Result<Config> {
        let mut config = self.backend.load()?;

        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(container) = self.container {
            config.container = container;
        }
        if self.create_container {
            config.create_container = true;
        }
        if let Some(path) = self.host_key {
            config.host_key_path = path;
        }
        if let Some(path) = self.authorized_keys {
            config.authorized_keys_path = path;
        }
        if let Some(path) = self.password_file {
            config.password_file_path = Some(path);
        }
        if let Some(dir) = self.scratch_dir {
            config.scratch_dir = dir;
        }
        if let Some(secs) = self.transfer_timeout {
            config.transfer_timeout_secs = secs;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(file) = self.log_file {
            config.logging.file = Some(file);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }

        config.expand_paths();
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Server(args) => run_server(args).await,
        Commands::HashPassword { username, format } => run_hash_password(&username, format),
        Commands::Container { backend, action } => run_container(&backend, action).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = args.into_config()?;
    let _log_guard = init_logging(&config)?;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Cirrus SFTP gateway"
    );
    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        container = %config.container,
        backend = ?config.backend,
        scratch_dir = %config.scratch_dir.display(),
        transfer_timeout_secs = config.transfer_timeout_secs,
        inactivity_timeout_secs = config.inactivity_timeout_secs,
        password_auth = config.password_file_path.is_some(),
        log_format = ?config.logging.format,
        "Gateway configuration"
    );

    let store = open_backend(&config.backend)
        .await
        .context("Failed to open object store")?;

    let server = match Server::new(config, store).await {
        Ok(server) => server,
        Err(e) => {
            error!(event = "server_creation_failed", error = %e, "Failed to create server");
            return Err(anyhow::Error::new(e).context("Failed to start gateway"));
        }
    };

    if let Err(e) = server.run().await {
        error!(event = "server_error", error = %e, "Server stopped");
        return Err(e.into());
    }

    info!(event = "server_shutdown", "Gateway shutdown complete");
    Ok(())
}

fn run_hash_password(username: &str, format: bool) -> Result<()> {
    if username.is_empty() || username.contains(':') {
        bail!("username must be non-empty and must not contain ':'");
    }

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("empty password");
    }

    let hash = hash_password(password)?;
    if format {
        println!("{username}:{hash}");
    } else {
        println!("{hash}");
    }
    Ok(())
}

async fn run_container(args: &BackendArgs, action: ContainerAction) -> Result<()> {
    let mut config = args.load()?;
    config.expand_paths();
    let store = open_backend(&config.backend)
        .await
        .context("Failed to open object store")?;

    match action {
        ContainerAction::List => {
            let containers = store.list_containers().await?;
            if containers.is_empty() {
                println!("No containers");
            }
            for c in containers {
                println!("{:<32} {:>10} objects {:>14} bytes", c.name, c.object_count, c.bytes);
            }
        }
        ContainerAction::Create { name } => {
            store
                .create_container(&name)
                .await
                .with_context(|| format!("Failed to create container {name}"))?;
            println!("Created container {name}");
        }
        ContainerAction::Delete { name, yes } => {
            let prompt = format!("Delete container {name} and every object in it?");
            if !yes && !confirm(&prompt, std::io::stdin().lock(), std::io::stdout())? {
                println!("Aborted");
                return Ok(());
            }
            store
                .delete_container(&name)
                .await
                .with_context(|| format!("Failed to delete container {name}"))?;
            println!("Deleted container {name}");
        }
    }
    Ok(())
}

/// Ask a yes/no question; anything but `y` or `yes` declines
fn confirm(prompt: &str, mut input: impl BufRead, mut output: impl Write) -> Result<bool> {
    write!(output, "{prompt} [y/N] ")?;
    output.flush()?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

/// Initialise tracing from the logging section
///
/// The returned guard must live as long as the process when logging to a file.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::new(config.logging.level.clone());

    let Some(log_file) = &config.logging.file else {
        match config.logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter()).init(),
        }
        return Ok(None);
    };

    let (Some(dir), Some(file_name)) = (log_file.parent(), log_file.file_name()) else {
        bail!("log file {} has no file name", log_file.display());
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_ansi(false)
            .init(),
    }
    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(reply: &str) -> bool {
        let mut shown = Vec::new();
        let accepted = confirm("Delete container c?", reply.as_bytes(), &mut shown).unwrap();
        assert_eq!(String::from_utf8(shown).unwrap(), "Delete container c? [y/N] ");
        accepted
    }

    #[test]
    fn test_confirm_requires_explicit_yes() {
        assert!(answer("y\n"));
        assert!(answer("YES\n"));
        assert!(!answer("\n"));
        assert!(!answer("n\n"));
        assert!(!answer(""));
    }

    #[test]
    fn test_container_delete_flags() {
        let cli = Cli::try_parse_from(["cirrus-sftp", "container", "--memory", "delete", "old", "--yes"])
            .unwrap();
        let Commands::Container { action, .. } = cli.command else {
            panic!("expected container command");
        };
        assert!(matches!(action, ContainerAction::Delete { ref name, yes: true } if name == "old"));
    }
}
