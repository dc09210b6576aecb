//! Update State Machine
//!
//! Tracks the controller phase and the last deployed release, persisted so a
//! restarted process does not re-apply a release it already installed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Phase of the update cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Waiting for the next tick
    #[default]
    Idle,
    /// Asking the release feed for the newest release
    Checking,
    /// Fetching and verifying the artifact
    Downloading,
    /// Extracting and swapping the deployment
    Applying,
}

/// Controller state persisted next to the deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentState {
    /// Tag of the last release that was fully deployed
    pub last_applied_tag: Option<String>,
    pub live_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Current phase; always `Idle` on disk after a clean tick
    #[serde(default)]
    pub status: UpdateStatus,
    /// Last time the feed was queried
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    /// Swap succeeded but the supervisor restart did not
    #[serde(default)]
    pub restart_pending: bool,
}

impl DeploymentState {
    pub fn new(live_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            last_applied_tag: None,
            live_dir,
            staging_dir,
            status: UpdateStatus::Idle,
            last_check: None,
            restart_pending: false,
        }
    }

    /// Load state from disk, or start fresh if none exists.
    ///
    /// Directories always come from the current configuration; only the
    /// progress fields are carried over.
    pub fn load_or_new(
        state_path: &Path,
        live_dir: PathBuf,
        staging_dir: PathBuf,
    ) -> Result<Self, StateError> {
        let mut state = Self::new(live_dir, staging_dir);
        if !state_path.exists() {
            return Ok(state);
        }

        let content = fs::read_to_string(state_path)
            .map_err(|e| StateError::ReadError(e.to_string()))?;
        let stored: DeploymentState = serde_json::from_str(&content)
            .map_err(|e| StateError::ParseError(e.to_string()))?;

        state.last_applied_tag = stored.last_applied_tag;
        state.last_check = stored.last_check;
        state.restart_pending = stored.restart_pending;
        // A crash mid-cycle leaves a stale phase behind
        state.status = UpdateStatus::Idle;
        Ok(state)
    }

    /// Save state to disk atomically
    pub fn save(&self, state_path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StateError::SerializeError(e.to_string()))?;

        if let Some(parent) = state_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StateError::WriteError(e.to_string()))?;
        }

        // Write to temp file first, then rename (atomic)
        let temp_path = state_path.with_extension("tmp");
        fs::write(&temp_path, &content)
            .map_err(|e| StateError::WriteError(e.to_string()))?;
        fs::rename(&temp_path, state_path)
            .map_err(|e| StateError::WriteError(e.to_string()))?;

        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.status == UpdateStatus::Idle
    }

    /// Idle -> Checking
    pub fn start_checking(&mut self) {
        self.status = UpdateStatus::Checking;
        self.last_check = Some(Utc::now());
    }

    /// Checking -> Downloading
    pub fn start_downloading(&mut self) {
        self.status = UpdateStatus::Downloading;
    }

    /// Downloading -> Applying
    pub fn start_applying(&mut self) {
        self.status = UpdateStatus::Applying;
    }

    /// Record a fully deployed release
    pub fn record_applied(&mut self, tag: &str) {
        self.last_applied_tag = Some(tag.to_string());
        self.restart_pending = true;
    }

    pub fn mark_restarted(&mut self) {
        self.restart_pending = false;
    }

    /// Back to Idle, from any phase
    pub fn reset(&mut self) {
        self.status = UpdateStatus::Idle;
    }

    /// True when `tag` differs from the last deployed release.
    pub fn is_new_release(&self, tag: &str) -> bool {
        self.last_applied_tag.as_deref() != Some(tag)
    }
}

/// State persistence errors
#[derive(Debug, Clone)]
pub enum StateError {
    ReadError(String),
    WriteError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadError(e) => write!(f, "Failed to read state: {}", e),
            Self::WriteError(e) => write!(f, "Failed to write state: {}", e),
            Self::ParseError(e) => write!(f, "Failed to parse state: {}", e),
            Self::SerializeError(e) => write!(f, "Failed to serialize state: {}", e),
        }
    }
}

impl std::error::Error for StateError {}
