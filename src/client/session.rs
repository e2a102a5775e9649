//! Saved login sessions
//!
//! A session file holds the credentials the client replays after every
//! reconnect. It is sealed with AES-256-GCM under a key derived from the
//! machine identifier and written as base64(nonce || ciphertext).

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const NONCE_LEN: usize = 12;

const MACHINE_ID_PATHS: [&str; 3] = ["/etc/machine-id", "/var/lib/dbus/machine-id", "/etc/hostname"];

const FALLBACK_MACHINE_ID: &str = "parley-local-session";

/// Credentials remembered between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub server_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("session record is malformed: {0}")]
    Format(#[from] serde_json::Error),

    #[error("session file is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("session data too short")]
    Truncated,

    #[error("failed to encrypt session")]
    Encrypt,

    #[error("failed to decrypt session")]
    Decrypt,

    #[error("no configuration directory available")]
    NoConfigDir,
}

/// AES-256-GCM sealing for session files
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    /// Derive the key as SHA-256 of an arbitrary secret
    pub fn from_secret(secret: &[u8]) -> Self {
        let key = Sha256::digest(secret);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Key bound to this machine
    pub fn for_machine() -> Self {
        Self::from_secret(machine_id().as_bytes())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SessionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SessionError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, SessionError> {
        let sealed = STANDARD.decode(encoded.trim())?;
        if sealed.len() < NONCE_LEN {
            return Err(SessionError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SessionError::Decrypt)
    }
}

/// First non-empty identifier among the machine-id files, `HOSTNAME`, then a constant
fn machine_id() -> String {
    MACHINE_ID_PATHS
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .find(|id| !id.is_empty())
        .or_else(|| {
            std::env::var("HOSTNAME")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| FALLBACK_MACHINE_ID.to_string())
}

/// One session file on disk
pub struct SessionStore {
    path: PathBuf,
    cipher: SessionCipher,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, cipher: SessionCipher) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    /// `<config dir>/parley/<profile>/session.json`, sealed with the machine key
    pub fn for_profile(profile: &str) -> Result<Self, SessionError> {
        let dir = dirs::config_dir()
            .ok_or(SessionError::NoConfigDir)?
            .join("parley")
            .join(profile);
        Ok(Self::new(dir.join("session.json"), SessionCipher::for_machine()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved session, or `None` when absent or unreadable
    pub fn load(&self) -> Option<SessionRecord> {
        match self.try_load() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Ignoring unreadable session file");
                None
            }
        }
    }

    /// Like [`SessionStore::load`] but reports why a file could not be read
    ///
    /// Files written before encryption was introduced are accepted and
    /// re-saved encrypted.
    pub fn try_load(&self) -> Result<Option<SessionRecord>, SessionError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match self.cipher.decrypt(&content) {
            Ok(plaintext) => Ok(Some(serde_json::from_slice(&plaintext)?)),
            Err(decrypt_error) => {
                let Ok(record) = serde_json::from_str::<SessionRecord>(&content) else {
                    return Err(decrypt_error);
                };
                tracing::info!(path = ?self.path, "Migrating plaintext session file");
                if let Err(e) = self.save(&record) {
                    tracing::warn!(path = ?self.path, error = %e, "Failed to re-save session encrypted");
                }
                Ok(Some(record))
            }
        }
    }

    pub fn save(&self, record: &SessionRecord) -> Result<(), SessionError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let sealed = self.cipher.encrypt(&serde_json::to_vec(record)?)?;

        // Staged owner-only, then renamed over whatever was there
        let staging = self.path.with_extension("tmp");
        let mut file = private_file(&staging)?;
        file.write_all(sealed.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    /// Forget the saved session; missing files are fine
    pub fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create or truncate a file readable by its owner only
fn private_file(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
