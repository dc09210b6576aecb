//! Companion Session Vault
//! Encrypted on-disk storage for the messaging client's credential blob

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::crypto::{CipherError, EnvelopeCipher, MasterKey};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("Vault IO error: {0}")]
    Io(#[from] io::Error),
}

impl VaultError {
    /// True when the stored envelope failed authentication.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Cipher(CipherError::Integrity))
    }
}

/// One encrypted credential blob at a fixed path.
///
/// Writes go through a temp file in the same directory and are renamed into
/// place, so a crash mid-save leaves the previous file intact.
pub struct SessionVault {
    path: PathBuf,
    key: Arc<MasterKey>,
    write_lock: Mutex<()>,
}

impl SessionVault {
    pub fn new(path: impl Into<PathBuf>, key: Arc<MasterKey>) -> Self {
        Self {
            path: path.into(),
            key,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Encrypt `blob` and atomically replace the vault file.
    pub fn save<T: Serialize + ?Sized>(&self, blob: &T) -> Result<(), VaultError> {
        let envelope = EnvelopeCipher::encrypt(self.key.as_bytes(), blob)?;
        let encoded = STANDARD.encode(&envelope);

        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let dir = self.parent_dir();
        fs::create_dir_all(dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(".session-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        restrict_permissions(temp.as_file())?;
        temp.write_all(encoded.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| VaultError::Io(e.error))?;

        sync_dir(dir);
        tracing::debug!(path = %self.path.display(), "session vault saved");
        Ok(())
    }

    /// Load and decrypt the blob. `Ok(None)` when nothing has been saved yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, VaultError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let envelope = STANDARD
            .decode(content.trim())
            .map_err(|e| CipherError::Format(format!("vault is not valid base64: {}", e)))?;
        let blob = EnvelopeCipher::decrypt(self.key.as_bytes(), &envelope)?;
        Ok(Some(blob))
    }

    /// Remove the vault file. Missing file is fine.
    pub fn purge(&self) -> Result<(), VaultError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "session vault purged");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

// Best effort: makes the rename itself durable on unix filesystems.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
