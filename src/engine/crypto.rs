//! Envelope Cipher
//!
//! AES-256-GCM envelope for arbitrary serializable values.
//! Layout: nonce (12) || tag (16) || ciphertext.

use std::fmt;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = NONCE_LEN + TAG_LEN;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Integrity check failed: envelope was tampered with or the key is wrong")]
    Integrity,
    #[error("Malformed payload: {0}")]
    Format(String),
}

/// 32-byte symmetric key. Wiped on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Builds a key from raw bytes; anything but 32 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| invalid_key_len(bytes.len()))?;
        Ok(Self(array))
    }

    /// Decodes a standard base64 key, as carried in `ENCRYPTION_KEY`.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::Configuration(format!("key is not valid base64: {}", e)))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }

    /// Fresh key from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

fn invalid_key_len(len: usize) -> CipherError {
    CipherError::Configuration(format!("key must be {} bytes, got {}", KEY_LEN, len))
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_LEN {
        return Err(invalid_key_len(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| invalid_key_len(key.len()))
}

/// Stateless envelope encryption over serde values.
pub struct EnvelopeCipher;

impl EnvelopeCipher {
    /// Serialize `value` and seal it under `key` with a fresh random nonce.
    pub fn encrypt<T: Serialize + ?Sized>(key: &[u8], value: &T) -> Result<Vec<u8>, CipherError> {
        let cipher = cipher_for(key)?;
        let mut buffer =
            serde_json::to_vec(value).map_err(|e| CipherError::Format(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CipherError::Format("plaintext too large".to_string()))?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + buffer.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&tag);
        envelope.extend_from_slice(&buffer);
        buffer.zeroize();
        Ok(envelope)
    }

    /// Authenticate and open an envelope, then deserialize its contents.
    pub fn decrypt<T: DeserializeOwned>(key: &[u8], envelope: &[u8]) -> Result<T, CipherError> {
        let cipher = cipher_for(key)?;
        if envelope.len() < HEADER_LEN {
            return Err(CipherError::Integrity);
        }

        let (nonce, rest) = envelope.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CipherError::Integrity)?;

        let value = serde_json::from_slice(&buffer).map_err(|e| CipherError::Format(e.to_string()));
        buffer.zeroize();
        value
    }
}
