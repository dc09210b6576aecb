//! Deployment
//!
//! Extracts a verified artifact into the staging directory and swaps it in
//! for the live deployment. Host specifics (archive formats, directory
//! renames, supervisor restarts) sit behind the [`Deployer`] trait.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use flate2::read::GzDecoder;
use thiserror::Error;

use super::download::Artifact;
use super::error::UpdateError;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Extraction failed: {0}")]
    Extract(String),
    #[error("Swap failed: {0}")]
    Swap(String),
    #[error("Restart failed: {0}")]
    Restart(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<DeployError> for UpdateError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Restart(reason) => Self::Restart(reason),
            other => Self::Deployment(other.to_string()),
        }
    }
}

/// Host capabilities needed to install a release.
pub trait Deployer: Send + Sync + 'static {
    /// Unpack `artifact` into the empty directory `staging`.
    fn extract(&self, artifact: &Artifact, staging: &Path) -> Result<(), DeployError>;

    /// Make `staging` the new `live` directory. On error `live` must be unchanged.
    fn swap(&self, staging: &Path, live: &Path) -> Result<(), DeployError>;

    /// Ask the process supervisor to restart `service`.
    fn restart(&self, service: &str) -> Result<(), DeployError>;
}

/// Package formats the host deployer can unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

/// In-process extraction, rename-based swap, command-based restart.
pub struct HostDeployer {
    restart_command: Vec<String>,
}

impl HostDeployer {
    /// `restart_command` is the supervisor program and its leading args,
    /// e.g. `["pm2", "restart"]`; the service name is appended.
    pub fn new(restart_command: Vec<String>) -> Self {
        Self { restart_command }
    }
}

impl Deployer for HostDeployer {
    fn extract(&self, artifact: &Artifact, staging: &Path) -> Result<(), DeployError> {
        let format = ArchiveFormat::detect(&artifact.name).ok_or_else(|| {
            DeployError::Extract(format!("unsupported package format: {}", artifact.name))
        })?;

        match format {
            ArchiveFormat::Zip => {
                let mut archive = zip::ZipArchive::new(Cursor::new(artifact.bytes.as_slice()))
                    .map_err(|e| DeployError::Extract(e.to_string()))?;
                archive
                    .extract(staging)
                    .map_err(|e| DeployError::Extract(e.to_string()))?;
            }
            ArchiveFormat::TarGz => {
                let decoder = GzDecoder::new(Cursor::new(artifact.bytes.as_slice()));
                let mut archive = tar::Archive::new(decoder);
                archive
                    .unpack(staging)
                    .map_err(|e| DeployError::Extract(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn swap(&self, staging: &Path, live: &Path) -> Result<(), DeployError> {
        swap_directories(staging, live)
    }

    fn restart(&self, service: &str) -> Result<(), DeployError> {
        let (program, args) = self
            .restart_command
            .split_first()
            .ok_or_else(|| DeployError::Restart("no restart command configured".to_string()))?;

        let program_path = which::which(program)
            .map_err(|e| DeployError::Restart(format!("{} not found: {}", program, e)))?;

        let output = Command::new(program_path)
            .args(args)
            .arg(service)
            .output()
            .map_err(|e| DeployError::Restart(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::Restart(format!(
                "{} exited with {:?}: {}",
                program,
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Path of the backup kept while a swap is in progress
pub fn backup_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_os_string();
    name.push(".previous");
    PathBuf::from(name)
}

/// Put the backup back when a swap died between its two renames.
///
/// Returns true if `live` was restored. A backup next to an existing `live`
/// is left alone; it is stale and the next swap clears it.
pub fn recover_interrupted_swap(live: &Path) -> Result<bool, DeployError> {
    let backup = backup_path(live);
    if live.exists() || !backup.is_dir() {
        return Ok(false);
    }
    fs::rename(&backup, live)
        .map_err(|e| DeployError::Swap(format!("could not restore previous deployment: {}", e)))?;
    tracing::warn!(live = %live.display(), "restored deployment left behind by an interrupted swap");
    Ok(true)
}

/// Rename `staging` over `live`, keeping the old contents until the new ones
/// are in place. Both paths must be on the same filesystem.
pub fn swap_directories(staging: &Path, live: &Path) -> Result<(), DeployError> {
    if !staging.is_dir() {
        return Err(DeployError::Swap(format!("{} is not a directory", staging.display())));
    }
    if let Some(parent) = live.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    recover_interrupted_swap(live)?;

    // Only reached with `live` present, so this never drops the last good copy
    let backup = backup_path(live);
    if backup.exists() && live.exists() {
        fs::remove_dir_all(&backup)?;
    }

    let had_live = live.exists();
    if had_live {
        fs::rename(live, &backup)
            .map_err(|e| DeployError::Swap(format!("could not move live aside: {}", e)))?;
    }

    if let Err(e) = fs::rename(staging, live) {
        if had_live {
            if let Err(restore) = fs::rename(&backup, live) {
                return Err(DeployError::Swap(format!(
                    "{}; restoring previous deployment also failed: {}",
                    e, restore
                )));
            }
        }
        return Err(DeployError::Swap(e.to_string()));
    }

    if had_live {
        if let Err(e) = fs::remove_dir_all(&backup) {
            tracing::warn!(path = %backup.display(), error = %e, "could not remove previous deployment");
        }
    }
    Ok(())
}

/// Drives a [`Deployer`] against fixed staging and live directories.
pub struct DeploymentApplier<D: Deployer> {
    deployer: Arc<D>,
    live_dir: PathBuf,
    staging_dir: PathBuf,
    service_name: String,
}

impl<D: Deployer> DeploymentApplier<D> {
    pub fn new(deployer: Arc<D>, live_dir: PathBuf, staging_dir: PathBuf, service_name: &str) -> Self {
        Self {
            deployer,
            live_dir,
            staging_dir,
            service_name: service_name.to_string(),
        }
    }

    pub fn live_dir(&self) -> &Path {
        &self.live_dir
    }

    /// Undo a swap that was cut short by a crash. Run before the first tick.
    pub fn recover(&self) -> Result<bool, UpdateError> {
        Ok(recover_interrupted_swap(&self.live_dir)?)
    }

    /// Extract and swap `artifact`, run `commit`, then restart the service.
    ///
    /// `commit` runs only once the new deployment is live and before the
    /// restart request, so the caller can durably record what was installed.
    /// Extraction or swap failure leaves the live directory untouched. A
    /// `commit` error is returned as is, with the new deployment already live.
    pub async fn apply<F>(&self, artifact: Artifact, commit: F) -> Result<(), UpdateError>
    where
        F: FnOnce() -> Result<(), UpdateError>,
    {
        let deployer = Arc::clone(&self.deployer);
        let staging = self.staging_dir.clone();
        let live = self.live_dir.clone();

        tokio::task::spawn_blocking(move || install(deployer.as_ref(), &artifact, &staging, &live))
            .await
            .map_err(|e| UpdateError::Deployment(format!("install task failed: {}", e)))??;

        commit()?;
        self.restart().await
    }

    /// Ask the supervisor to restart the service.
    pub async fn restart(&self) -> Result<(), UpdateError> {
        let deployer = Arc::clone(&self.deployer);
        let service = self.service_name.clone();
        tokio::task::spawn_blocking(move || deployer.restart(&service))
            .await
            .map_err(|e| UpdateError::Restart(format!("restart task failed: {}", e)))??;
        tracing::info!(service = %self.service_name, "restart requested");
        Ok(())
    }
}

fn install<D: Deployer + ?Sized>(
    deployer: &D,
    artifact: &Artifact,
    staging: &Path,
    live: &Path,
) -> Result<(), DeployError> {
    if staging.exists() {
        fs::remove_dir_all(staging)?;
    }
    fs::create_dir_all(staging)?;

    let result = deployer
        .extract(artifact, staging)
        .and_then(|()| deployer.swap(staging, live));

    if let Err(e) = result {
        if staging.exists() {
            let _ = fs::remove_dir_all(staging);
        }
        return Err(e);
    }

    tracing::info!(tag = %artifact.tag, live = %live.display(), "deployment swapped in");
    Ok(())
}
