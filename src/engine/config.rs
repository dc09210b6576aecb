//! Companion Configuration Module
//! Builds the process-wide configuration once from the environment

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::crypto::{CipherError, MasterKey};
use super::updater::download::DEFAULT_MAX_ARTIFACT_BYTES;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_CHANNEL: &str = "stable";
pub const DEFAULT_PACKAGE_SUFFIX: &str = ".zip";
pub const DEFAULT_SERVICE_NAME: &str = "companion";
pub const DEFAULT_RESTART_COMMAND: &str = "pm2 restart";
const DEFAULT_INTERVAL_SECS: u64 = 300;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("Invalid ENCRYPTION_KEY: {0}")]
    Key(#[from] CipherError),
    #[error("Could not determine a data directory for the session vault")]
    NoDataDir,
}

/// Everything the companion needs, resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub master_key: Arc<MasterKey>,
    pub vault_path: PathBuf,
    pub updater: UpdaterConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterConfig {
    pub enabled: bool,
    pub repo: String,
    pub token: Option<String>,
    pub api_url: String,
    pub channel: String,
    pub interval: Duration,
    pub package_suffix: String,
    /// Hex Ed25519 key; when set, release signatures are required.
    pub public_key: Option<String>,
    pub live_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub state_path: PathBuf,
    pub service_name: String,
    pub restart_command: Vec<String>,
    pub http_timeout: Duration,
    /// Largest asset the updater will download
    pub max_artifact_bytes: u64,
}

impl UpdaterConfig {
    /// Defaults rooted at `live_dir`, with the updater disabled.
    pub fn for_live_dir(live_dir: impl Into<PathBuf>) -> Self {
        let live_dir = live_dir.into();
        Self {
            enabled: false,
            repo: String::new(),
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            package_suffix: DEFAULT_PACKAGE_SUFFIX.to_string(),
            public_key: None,
            staging_dir: sibling(&live_dir, "_new"),
            state_path: sibling(&live_dir, ".state.json"),
            live_dir,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            restart_command: split_command(DEFAULT_RESTART_COMMAND),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }

    /// Check the settings the update loop cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repo.is_empty() {
            return Err(ConfigError::Missing("GITHUB_REPO"));
        }
        if self.repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(ConfigError::Invalid {
                name: "GITHUB_REPO",
                reason: "expected owner/name".to_string(),
            });
        }
        if self.restart_command.is_empty() {
            return Err(ConfigError::Invalid {
                name: "RESTART_COMMAND",
                reason: "command is empty".to_string(),
            });
        }
        if self.live_dir == self.staging_dir {
            return Err(ConfigError::Invalid {
                name: "STAGING_DIR",
                reason: "must differ from DEPLOY_DIR".to_string(),
            });
        }
        if let Some(key) = &self.public_key {
            let bytes = hex::decode(key).map_err(|e| ConfigError::Invalid {
                name: "UPDATER_PUBLIC_KEY",
                reason: e.to_string(),
            })?;
            if bytes.len() != 32 {
                return Err(ConfigError::Invalid {
                    name: "UPDATER_PUBLIC_KEY",
                    reason: format!("expected 32 bytes, got {}", bytes.len()),
                });
            }
        }
        Ok(())
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let encoded_key = get("ENCRYPTION_KEY").ok_or(ConfigError::Missing("ENCRYPTION_KEY"))?;
        let master_key = Arc::new(MasterKey::from_base64(&encoded_key)?);

        let vault_path = match get("SESSION_VAULT_PATH") {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join("companion")
                .join("session.vault"),
        };

        let live_dir = PathBuf::from(get("DEPLOY_DIR").unwrap_or_else(|| "/opt/companion".to_string()));
        let mut updater = UpdaterConfig::for_live_dir(live_dir);

        updater.enabled = match get("UPDATER_ENABLED") {
            Some(v) => parse_flag("UPDATER_ENABLED", &v)?,
            None => false,
        };
        if let Some(dir) = get("STAGING_DIR") {
            updater.staging_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("UPDATER_STATE_PATH") {
            updater.state_path = PathBuf::from(path);
        }
        updater.repo = get("GITHUB_REPO").unwrap_or_default();
        updater.token = get("GITHUB_TOKEN");
        if let Some(url) = get("GITHUB_API_URL") {
            updater.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(channel) = get("UPDATER_CHANNEL") {
            updater.channel = channel;
        }
        if let Some(secs) = get("UPDATER_INTERVAL_SECS") {
            updater.interval = Duration::from_secs(parse_positive("UPDATER_INTERVAL_SECS", &secs)?);
        }
        if let Some(suffix) = get("UPDATER_PACKAGE_SUFFIX") {
            updater.package_suffix = suffix;
        }
        updater.public_key = get("UPDATER_PUBLIC_KEY");
        if let Some(name) = get("SERVICE_NAME") {
            updater.service_name = name;
        }
        if let Some(command) = get("RESTART_COMMAND") {
            updater.restart_command = split_command(&command);
        }
        if let Some(secs) = get("HTTP_TIMEOUT_SECS") {
            updater.http_timeout = Duration::from_secs(parse_positive("HTTP_TIMEOUT_SECS", &secs)?);
        }

        if let Some(bytes) = get("UPDATER_MAX_ARTIFACT_BYTES") {
            updater.max_artifact_bytes = parse_positive("UPDATER_MAX_ARTIFACT_BYTES", &bytes)?;
        }

        if updater.enabled {
            updater.validate()?;
        }

        Ok(Self {
            master_key,
            vault_path,
            updater,
        })
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a boolean, got '{}'", other),
        }),
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

fn sibling(dir: &std::path::Path, suffix: &str) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
