//! Artifact Fetcher
//!
//! Downloads a release's package and its integrity companions into memory.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH};

use super::error::UpdateError;
use super::feed::{ReleaseAsset, ReleaseDescriptor};

/// Companion asset holding the sha256 of the package
pub const CHECKSUM_EXT: &str = ".sha256";
/// Companion asset holding a hex Ed25519 signature of the package
pub const SIGNATURE_EXT: &str = ".sig";

/// Downloaded release package
#[derive(Debug, Clone)]
pub struct Artifact {
    pub tag: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Build the HTTP client shared by the feed and the fetcher.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, UpdateError> {
    reqwest::Client::builder()
        .user_agent(concat!("companion-updater/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .map_err(|e| UpdateError::Network(e.to_string()))
}

/// Default cap on a single downloaded asset
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 256 * 1024 * 1024;

/// Fetches release assets
pub struct ArtifactFetcher {
    client: reqwest::Client,
    token: Option<String>,
    package_suffix: String,
    max_bytes: u64,
}

impl ArtifactFetcher {
    pub fn new(client: reqwest::Client, token: Option<String>, package_suffix: &str) -> Self {
        Self {
            client,
            token,
            package_suffix: package_suffix.to_string(),
            max_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }

    /// Reject any asset larger than `max_bytes`.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Download the first asset ending in the package suffix.
    pub async fn fetch(&self, release: &ReleaseDescriptor) -> Result<Artifact, UpdateError> {
        let asset = release
            .find_asset(&self.package_suffix)
            .ok_or_else(|| UpdateError::AssetNotFound {
                tag: release.tag_name.clone(),
                suffix: self.package_suffix.clone(),
            })?;

        let tag = release.tag_name.as_str();
        let bytes = self
            .download(asset, |downloaded, total| {
                tracing::trace!(tag, downloaded, total, "artifact download progress");
            })
            .await?;

        tracing::info!(tag, asset = %asset.name, bytes = bytes.len(), "artifact downloaded");
        Ok(Artifact {
            tag: release.tag_name.clone(),
            name: asset.name.clone(),
            bytes,
        })
    }

    /// Download `<artifact_name><extension>` as text, e.g. the `.sha256` file.
    pub async fn fetch_companion(
        &self,
        release: &ReleaseDescriptor,
        artifact_name: &str,
        extension: &str,
    ) -> Result<String, UpdateError> {
        let name = format!("{}{}", artifact_name, extension);
        let asset = release
            .asset_named(&name)
            .ok_or_else(|| UpdateError::AssetNotFound {
                tag: release.tag_name.clone(),
                suffix: extension.to_string(),
            })?;

        let bytes = self.download(asset, |_, _| {}).await?;
        String::from_utf8(bytes)
            .map_err(|_| UpdateError::Verification(format!("{} is not valid UTF-8", name)))
    }

    /// Stream an asset into memory, reporting (downloaded, total) after each chunk.
    async fn download<F>(&self, asset: &ReleaseAsset, mut on_progress: F) -> Result<Vec<u8>, UpdateError>
    where
        F: FnMut(u64, u64),
    {
        let mut request = self
            .client
            .get(&asset.download_url)
            .header(ACCEPT, "application/octet-stream");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {}", token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "download of {} returned HTTP {}",
                asset.name,
                response.status()
            )));
        }

        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if total > self.max_bytes {
            return Err(self.too_large(asset));
        }

        let mut bytes = Vec::with_capacity(total.min(64 * 1024 * 1024) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(self.too_large(asset));
            }
            bytes.extend_from_slice(&chunk);
            on_progress(bytes.len() as u64, total);
        }

        Ok(bytes)
    }

    fn too_large(&self, asset: &ReleaseAsset) -> UpdateError {
        UpdateError::TooLarge {
            name: asset.name.clone(),
            limit: self.max_bytes,
        }
    }
}
