//! Cryptographic Verification
//!
//! SHA256 checksum gate (always) and ED25519 signature gate (when a release
//! key is configured) for downloaded artifacts.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use super::error::UpdateError;

/// Verification errors
#[derive(Debug, PartialEq)]
pub enum VerifyError {
    ChecksumMismatch { expected: String, actual: String },
    MalformedChecksum,
    MissingSignature,
    InvalidSignature,
    InvalidPublicKey,
    ParseError(String),
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "Checksum mismatch: expected {}, got {}", expected, actual)
            }
            Self::MalformedChecksum => write!(f, "Checksum file does not contain a sha256 digest"),
            Self::MissingSignature => write!(f, "Release is not signed"),
            Self::InvalidSignature => write!(f, "Invalid signature"),
            Self::InvalidPublicKey => write!(f, "Invalid public key"),
            Self::ParseError(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<VerifyError> for UpdateError {
    fn from(e: VerifyError) -> Self {
        Self::Verification(e.to_string())
    }
}

/// Verifier for downloaded artifacts
#[derive(Debug, Default)]
pub struct ArtifactVerifier {
    /// Release signing key; `None` means checksum-only
    public_key: Option<VerifyingKey>,
}

impl ArtifactVerifier {
    /// Checksum-only verifier
    pub fn new() -> Self {
        Self { public_key: None }
    }

    /// Verifier that also demands a valid signature
    pub fn with_public_key(key_bytes: &[u8; 32]) -> Result<Self, VerifyError> {
        let public_key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|_| VerifyError::InvalidPublicKey)?;
        Ok(Self { public_key: Some(public_key) })
    }

    /// Build from the optional hex key in the configuration
    pub fn from_hex_key(hex_key: Option<&str>) -> Result<Self, VerifyError> {
        let Some(hex_key) = hex_key else {
            return Ok(Self::new());
        };
        let bytes = hex::decode(hex_key.trim()).map_err(|e| VerifyError::ParseError(e.to_string()))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| VerifyError::InvalidPublicKey)?;
        Self::with_public_key(&key)
    }

    pub fn requires_signature(&self) -> bool {
        self.public_key.is_some()
    }

    /// Calculate SHA256 checksum of a buffer
    pub fn calculate_sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Pull the digest out of a `sha256sum`-style line: `<hex>  <file>`.
    pub fn parse_checksum_file(content: &str) -> Result<String, VerifyError> {
        let digest = content
            .split_whitespace()
            .next()
            .ok_or(VerifyError::MalformedChecksum)?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VerifyError::MalformedChecksum);
        }
        Ok(digest.to_lowercase())
    }

    /// Verify a buffer against an expected hex digest
    pub fn verify_checksum(&self, data: &[u8], expected: &str) -> Result<(), VerifyError> {
        let actual = Self::calculate_sha256(data);
        if actual != expected.to_lowercase() {
            return Err(VerifyError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Verify a hex signature over the raw artifact bytes
    pub fn verify_signature(&self, data: &[u8], signature_hex: &str) -> Result<(), VerifyError> {
        let Some(public_key) = &self.public_key else {
            return Ok(());
        };

        let sig_bytes = hex::decode(signature_hex.trim())
            .map_err(|e| VerifyError::ParseError(e.to_string()))?;
        let sig_array: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| VerifyError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_array);

        public_key
            .verify(data, &signature)
            .map_err(|_| VerifyError::InvalidSignature)
    }

    /// Full gate: checksum always, signature when a key is configured.
    pub fn verify(
        &self,
        data: &[u8],
        checksum_file: &str,
        signature: Option<&str>,
    ) -> Result<(), VerifyError> {
        let expected = Self::parse_checksum_file(checksum_file)?;
        self.verify_checksum(data, &expected)?;

        if self.requires_signature() {
            let signature = signature.ok_or(VerifyError::MissingSignature)?;
            self.verify_signature(data, signature)?;
        }
        Ok(())
    }
}
