//! Release Feed
//!
//! Lists releases from a GitHub-compatible hosting API and picks the newest
//! one on a channel. The API is trusted to return releases newest-first.

use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};

use super::error::UpdateError;

/// One published release
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseDescriptor {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// Downloadable file attached to a release
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(alias = "browser_download_url")]
    pub download_url: String,
}

impl ReleaseDescriptor {
    /// Channel membership is a plain substring match on the tag.
    pub fn is_on_channel(&self, channel: &str) -> bool {
        self.tag_name.contains(channel)
    }

    /// First asset whose name ends with `suffix`
    pub fn find_asset(&self, suffix: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name.ends_with(suffix))
    }

    pub fn asset_named(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

/// Client for the release list endpoint
pub struct ReleaseFeed {
    client: reqwest::Client,
    api_url: String,
}

impl ReleaseFeed {
    pub fn new(client: reqwest::Client, api_url: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch all releases of `repo` (`owner/name`), optionally authenticated.
    pub async fn list_releases(
        &self,
        repo: &str,
        token: Option<&str>,
    ) -> Result<Vec<ReleaseDescriptor>, UpdateError> {
        let url = format!("{}/repos/{}/releases", self.api_url, repo);

        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("token {}", token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "release list for {} returned HTTP {}",
                repo,
                response.status()
            )));
        }

        let releases: Vec<ReleaseDescriptor> = response.json().await?;
        tracing::debug!(repo, count = releases.len(), "fetched release list");
        Ok(releases)
    }

    /// Newest release on `channel`, relying on the upstream newest-first order.
    pub fn select_latest<'a>(
        releases: &'a [ReleaseDescriptor],
        channel: &str,
    ) -> Option<&'a ReleaseDescriptor> {
        releases.iter().find(|release| release.is_on_channel(channel))
    }
}
