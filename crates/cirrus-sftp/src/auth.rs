//! Authentication
//!
//! Public keys are matched by SHA-256 fingerprint against an OpenSSH
//! `authorized_keys` file. Passwords, when a credential file is configured,
//! are verified against per-entry-salted Argon2id hashes.
//!
//! Every rejection reason is logged for the operator but collapsed into a
//! fixed message for the client: `unknown public key for <user>` or
//! `password rejected`.

use crate::session::SessionInfo;
use crate::{Error, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use russh::keys::{HashAlg, PublicKey};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Client-facing message for any failed password attempt
pub const PASSWORD_REJECTED: &str = "password rejected";

/// Authorized keys manager
pub struct AuthorizedKeys {
    /// Path to authorized_keys file
    keys_file: PathBuf,
    /// Parsed public keys
    keys: Vec<PublicKey>,
}

impl AuthorizedKeys {
    /// Create an empty key set bound to `keys_file`; call [`Self::load`] to read it
    pub fn new(keys_file: impl Into<PathBuf>) -> Self {
        Self {
            keys_file: keys_file.into(),
            keys: Vec::new(),
        }
    }

    /// Load authorized keys from file
    ///
    /// Malformed lines are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file is missing or unreadable
    pub fn load(&mut self) -> Result<()> {
        let path = self.keys_file.as_path();

        if !path.exists() {
            warn!(path = %path.display(), "Authorized keys file not found");
            return Err(Error::Config(format!(
                "Authorized keys file not found: {}",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read authorized_keys: {e}")))?;

        self.keys.clear();

        for (index, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match Self::parse_key_line(trimmed) {
                Ok(key) => {
                    debug!(line = index + 1, "Loaded public key");
                    self.keys.push(key);
                }
                Err(e) => {
                    warn!(line = index + 1, error = %e, "Skipping malformed authorized key");
                }
            }
        }

        info!(
            count = self.keys.len(),
            path = %path.display(),
            "Loaded authorized keys"
        );

        Ok(())
    }

    /// Parse one `<type> <base64> [comment]` line
    fn parse_key_line(line: &str) -> Result<PublicKey> {
        let mut parts = line.split_whitespace();
        let (Some(_key_type), Some(key_data)) = (parts.next(), parts.next()) else {
            return Err(Error::Config(
                "Invalid key format: expected at least <type> <key>".into(),
            ));
        };

        russh::keys::parse_public_key_base64(key_data)
            .map_err(|e| Error::Config(format!("Failed to parse public key: {e}")))
    }

    /// Check whether `key` matches an authorized key by SHA-256 fingerprint
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        let presented = key.fingerprint(HashAlg::Sha256);
        self.keys
            .iter()
            .any(|authorized| authorized.fingerprint(HashAlg::Sha256) == presented)
    }

    /// Number of keys loaded
    pub fn count(&self) -> usize {
        self.keys.len()
    }
}

/// Credential store parsed from a `username:hash` file
pub struct PasswordStore {
    hashes: HashMap<String, String>,
    dummy_hash: String,
}

impl PasswordStore {
    /// Load a credential file
    ///
    /// Only Argon2 PHC strings are accepted. Legacy 64-hex-digit SHA-256
    /// entries are skipped with a warning naming the user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read password file: {e}")))?;
        let store = Self::parse(&contents)?;

        info!(
            users = store.hashes.len(),
            path = %path.display(),
            "Loaded password file"
        );
        Ok(store)
    }

    /// Parse credential file contents
    ///
    /// # Errors
    ///
    /// Returns an error only if the timing-equalisation hash cannot be built
    pub fn parse(contents: &str) -> Result<Self> {
        let mut hashes = HashMap::new();

        for (index, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((user, hash)) = trimmed.split_once(':') else {
                warn!(line = index + 1, "Skipping password entry without ':'");
                continue;
            };
            let (user, hash) = (user.trim(), hash.trim());

            if user.is_empty() {
                warn!(line = index + 1, "Skipping password entry with empty user");
                continue;
            }
            if is_legacy_hash(hash) {
                warn!(
                    user,
                    "Skipping legacy SHA-256 password entry; re-hash with `cirrus-sftp hash-password`"
                );
                continue;
            }
            if !hash.starts_with("$argon2") || PasswordHash::new(hash).is_err() {
                warn!(user, line = index + 1, "Skipping unsupported password hash");
                continue;
            }

            hashes.insert(user.to_string(), hash.to_string());
        }

        Ok(Self {
            hashes,
            dummy_hash: hash_password("cirrus-timing-equaliser")?,
        })
    }

    /// Number of usable entries
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Whether no usable entries were loaded
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Verify a password on a blocking thread
    ///
    /// Unknown users are checked against a dummy hash so the response time
    /// does not reveal whether the account exists.
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let (hash, known) = match self.hashes.get(username) {
            Some(hash) => (hash.clone(), true),
            None => (self.dummy_hash.clone(), false),
        };
        let password = password.to_owned();

        let matched = tokio::task::spawn_blocking(move || verify_hash(&password, &hash))
            .await
            .unwrap_or(false);

        known && matched
    }
}

fn is_legacy_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

fn verify_hash(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Produce an Argon2id PHC string with a random per-entry salt
///
/// # Errors
///
/// Returns [`Error::Other`] if hashing fails
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    // m=19 MiB, t=2, p=1
    let params = Params::new(19456, 2, 1, None)
        .map_err(|e| Error::Other(format!("Invalid Argon2 parameters: {e}")))?;

    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Other(format!("Failed to hash password: {e}")))
}

/// Per-connection authenticator
///
/// Built for each accepted connection, so edits to the authorized keys file
/// apply to the next connection without a restart.
pub struct Authenticator {
    keys: AuthorizedKeys,
    passwords: Option<Arc<PasswordStore>>,
}

impl Authenticator {
    /// Combine a loaded key set with an optional credential store
    pub fn new(keys: AuthorizedKeys, passwords: Option<Arc<PasswordStore>>) -> Self {
        Self { keys, passwords }
    }

    /// Whether password authentication should be offered
    pub fn offers_password(&self) -> bool {
        self.passwords.is_some()
    }

    /// Authenticate by public key
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] with `unknown public key for <user>`
    pub fn verify_publickey(
        &self,
        username: &str,
        key: &PublicKey,
        peer: Option<SocketAddr>,
    ) -> Result<SessionInfo> {
        let fingerprint = key.fingerprint(HashAlg::Sha256);

        if !self.keys.is_authorized(key) {
            warn!(
                event = "auth_failure",
                method = "publickey",
                user = %username,
                peer = ?peer,
                fingerprint = %fingerprint,
                "Public key rejected"
            );
            return Err(Error::Authentication(format!(
                "unknown public key for {username}"
            )));
        }

        let session = SessionInfo::new(username, peer);
        info!(
            event = "auth_success",
            method = "publickey",
            session_id = %session.session_id,
            user = %username,
            peer = %session.remote_addr,
            fingerprint = %fingerprint,
            "Public key accepted"
        );
        Ok(session)
    }

    /// Authenticate by password
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] with `password rejected` for every
    /// failure, including when password authentication is not configured
    pub async fn verify_password(
        &self,
        username: &str,
        password: &str,
        peer: Option<SocketAddr>,
    ) -> Result<SessionInfo> {
        let accepted = match &self.passwords {
            Some(store) => store.verify(username, password).await,
            None => false,
        };

        if !accepted {
            warn!(
                event = "auth_failure",
                method = "password",
                user = %username,
                peer = ?peer,
                "Password rejected"
            );
            return Err(Error::Authentication(PASSWORD_REJECTED.to_string()));
        }

        let session = SessionInfo::new(username, peer);
        info!(
            event = "auth_success",
            method = "password",
            session_id = %session.session_id,
            user = %username,
            peer = %session.remote_addr,
            "Password accepted"
        );
        Ok(session)
    }
}
