//! Configuration for the gateway

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener address (`host:port`)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Object container every session reads and writes
    #[serde(default)]
    pub container: String,

    /// OpenSSH private host key; an Ed25519 key is generated here if missing
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// Authorized keys file, re-read for every new connection
    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: PathBuf,

    /// Optional `username:hash` file; enables password authentication
    #[serde(default)]
    pub password_file_path: Option<PathBuf>,

    /// Create the container at startup if it does not exist
    #[serde(default)]
    pub create_container: bool,

    /// Seconds a read may wait on a stalled background download
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,

    /// Directory for scratch files
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// SSH inactivity timeout in seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Object storage backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Object storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Process-local store, lost on exit
    Memory,
    /// Local directory acting as the object service
    Directory {
        /// Store root
        root: PathBuf,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Directory {
            root: PathBuf::from("./objects"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            container: String::new(),
            host_key_path: default_host_key_path(),
            authorized_keys_path: default_authorized_keys_path(),
            password_file_path: None,
            create_container: false,
            transfer_timeout_secs: default_transfer_timeout(),
            scratch_dir: default_scratch_dir(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] naming the first invalid field
    pub fn validate(&self) -> crate::Result<()> {
        if self.container.trim().is_empty() {
            return Err(crate::Error::Config("container must be set".to_string()));
        }

        if self.transfer_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "transfer_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if !self.authorized_keys_path.is_file() {
            return Err(crate::Error::Config(format!(
                "Authorized keys file does not exist: {}",
                self.authorized_keys_path.display()
            )));
        }

        if let Some(path) = &self.password_file_path {
            if !path.is_file() {
                return Err(crate::Error::Config(format!(
                    "Password file does not exist: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// Expand `~` and make every configured path absolute
    pub fn expand_paths(&mut self) {
        let cwd = std::env::current_dir().ok();
        let fix = |path: &mut PathBuf| {
            let expanded = expand_tilde(path);
            *path = match (&cwd, expanded.is_absolute()) {
                (Some(cwd), false) => cwd.join(expanded),
                _ => expanded,
            };
        };

        fix(&mut self.host_key_path);
        fix(&mut self.authorized_keys_path);
        fix(&mut self.scratch_dir);
        if let Some(path) = self.password_file_path.as_mut() {
            fix(path);
        }
        if let BackendConfig::Directory { root } = &mut self.backend {
            fix(root);
        }
        if let Some(path) = self.logging.file.as_mut() {
            fix(path);
        }
    }

    /// Read-side download wait as a [`Duration`]
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// SSH inactivity timeout, `None` when disabled with 0
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0).then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:20022".to_string()
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("./server.key")
}

fn default_authorized_keys_path() -> PathBuf {
    PathBuf::from("~/.ssh/authorized_keys")
}

fn default_transfer_timeout() -> u64 {
    180
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_inactivity_timeout() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_address, "127.0.0.1:20022");
        assert_eq!(config.transfer_timeout(), Duration::from_secs(180));
        assert_eq!(config.inactivity_timeout(), Some(Duration::from_secs(600)));
        assert!(!config.create_container);
        assert!(config.password_file_path.is_none());
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_toml_with_memory_backend() {
        let config: Config = toml::from_str(
            r#"
            container = "uploads"
            transfer_timeout_secs = 30

            [backend]
            kind = "memory"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.container, "uploads");
        assert_eq!(config.transfer_timeout_secs, 30);
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_toml_with_directory_backend() {
        let config: Config = toml::from_str(
            r#"
            container = "c"

            [backend]
            kind = "directory"
            root = "/srv/objects"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.backend,
            BackendConfig::Directory {
                root: PathBuf::from("/srv/objects")
            }
        );
    }

    #[test]
    fn test_validate() {
        let dir = TempDir::new().unwrap();
        let keys = dir.path().join("authorized_keys");
        std::fs::write(&keys, "").unwrap();

        let mut config = Config {
            authorized_keys_path: keys,
            ..Config::default()
        };
        assert!(config.validate().is_err(), "container is required");

        config.container = "c".to_string();
        assert!(config.validate().is_ok());

        config.transfer_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.transfer_timeout_secs = 5;

        config.password_file_path = Some(dir.path().join("missing"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_paths_makes_absolute() {
        let mut config = Config {
            host_key_path: PathBuf::from("relative.key"),
            ..Config::default()
        };
        config.expand_paths();

        assert!(config.host_key_path.is_absolute());
        assert!(config.host_key_path.ends_with("relative.key"));
        if let BackendConfig::Directory { root } = &config.backend {
            assert!(root.is_absolute());
        }
    }
}
