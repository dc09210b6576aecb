//! Update error types

use thiserror::Error;

use super::state::StateError;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Release {tag} has no asset ending in '{suffix}'")]
    AssetNotFound { tag: String, suffix: String },
    #[error("Asset {name} exceeds the {limit} byte download limit")]
    TooLarge { name: String, limit: u64 },
    #[error("Artifact verification failed: {0}")]
    Verification(String),
    #[error("Deployment failed: {0}")]
    Deployment(String),
    #[error("Restart failed: {0}")]
    Restart(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        // Strip the URL: asset locators may carry signed query strings
        Self::Network(e.without_url().to_string())
    }
}

impl UpdateError {
    /// Transient errors are retried on the next tick without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::AssetNotFound { .. } | Self::Cancelled
        )
    }
}
