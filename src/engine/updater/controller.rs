//! Update Controller
//!
//! Polls the release feed on a fixed schedule and drives a new release
//! through download, verification and deployment. One cycle at a time.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::deploy::{Deployer, DeploymentApplier, HostDeployer};
use super::download::{http_client, Artifact, ArtifactFetcher, CHECKSUM_EXT, SIGNATURE_EXT};
use super::error::UpdateError;
use super::feed::{ReleaseDescriptor, ReleaseFeed};
use super::state::{DeploymentState, StateError, UpdateStatus};
use super::verify::ArtifactVerifier;
use crate::engine::config::UpdaterConfig;

/// Result of one timer tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Another cycle is still running
    Busy,
    /// Shutdown was requested before the tick started
    Stopped,
    /// No release on the configured channel
    NoRelease,
    /// Newest release is already deployed
    UpToDate { tag: String },
    /// Release is live; `restarted` is false if the restart was withheld or
    /// the supervisor call failed
    Applied { tag: String, restarted: bool },
    /// Cycle aborted in `stage`; the previous deployment stays live
    Failed { stage: UpdateStatus, error: String },
}

/// Read-only view of the feed, for `companion update check`
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub channel: String,
    pub latest: Option<String>,
    pub last_applied: Option<String>,
    pub update_available: bool,
}

/// Clears the in-flight flag even if the tick future is dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UpdateController<D: Deployer = HostDeployer> {
    config: UpdaterConfig,
    feed: ReleaseFeed,
    fetcher: ArtifactFetcher,
    verifier: ArtifactVerifier,
    applier: DeploymentApplier<D>,
    state: Mutex<DeploymentState>,
    busy: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl UpdateController<HostDeployer> {
    /// Controller using the host's archive tools and supervisor command.
    pub fn from_config(
        config: UpdaterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, UpdateError> {
        let deployer = Arc::new(HostDeployer::new(config.restart_command.clone()));
        Self::with_deployer(config, deployer, shutdown)
    }
}

impl<D: Deployer> UpdateController<D> {
    pub fn with_deployer(
        config: UpdaterConfig,
        deployer: Arc<D>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, UpdateError> {
        let client = http_client(config.http_timeout)?;
        let feed = ReleaseFeed::new(client.clone(), &config.api_url);
        let fetcher = ArtifactFetcher::new(client, config.token.clone(), &config.package_suffix)
            .with_max_bytes(config.max_artifact_bytes);
        let verifier = ArtifactVerifier::from_hex_key(config.public_key.as_deref())?;
        let applier = DeploymentApplier::new(
            deployer,
            config.live_dir.clone(),
            config.staging_dir.clone(),
            &config.service_name,
        );

        let state = DeploymentState::load_or_new(
            &config.state_path,
            config.live_dir.clone(),
            config.staging_dir.clone(),
        )?;
        if let Err(e) = applier.recover() {
            tracing::error!(error = %e, live = %config.live_dir.display(), "could not recover interrupted swap");
        }

        Ok(Self {
            config,
            feed,
            fetcher,
            verifier,
            applier,
            state: Mutex::new(state),
            busy: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Snapshot of the current state
    pub fn state(&self) -> DeploymentState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, DeploymentState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, f: impl FnOnce(&mut DeploymentState)) {
        f(&mut *self.lock_state());
    }

    fn save_state(&self) -> Result<(), StateError> {
        self.lock_state().save(&self.config.state_path)
    }

    fn persist(&self) {
        if let Err(e) = self.save_state() {
            tracing::warn!(error = %e, "could not persist update state");
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tick on the configured interval until shutdown is signalled.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.clone();

        tracing::info!(
            repo = %self.config.repo,
            channel = %self.config.channel,
            interval_secs = self.config.interval.as_secs(),
            "update controller started"
        );

        let pending = {
            let mut state = self.lock_state();
            let tag = state.last_applied_tag.clone();
            let pending = state.restart_pending;
            if pending {
                state.mark_restarted();
            }
            pending.then_some(tag)
        };
        if let Some(tag) = pending {
            // This process is the restart the last deployment asked for
            tracing::info!(tag = ?tag, "running after deployment");
            self.persist();
        }

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = interval.tick() => {
                    // The tick itself is not raced against shutdown, so an
                    // apply in progress always runs to completion.
                    let outcome = self.tick().await;
                    tracing::debug!(?outcome, "update tick finished");
                }
            }
        }

        tracing::info!("update controller stopped");
    }

    /// Run one update cycle.
    pub async fn tick(&self) -> TickOutcome {
        if self.shutdown_requested() {
            return TickOutcome::Stopped;
        }
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            tracing::debug!("previous update cycle still running, skipping tick");
            return TickOutcome::Busy;
        };

        if self.lock_state().restart_pending {
            self.retry_restart().await;
        }

        let outcome = self.cycle().await;
        self.transition(DeploymentState::reset);
        self.persist();
        outcome
    }

    /// The restart only goes out once the deployed tag is on disk, otherwise
    /// the new process would install the same release again.
    async fn retry_restart(&self) {
        if let Err(e) = self.save_state() {
            tracing::error!(error = %e, "deployment record still not persisted, restart withheld");
            return;
        }
        match self.applier.restart().await {
            Ok(()) => {
                self.transition(DeploymentState::mark_restarted);
                self.persist();
            }
            Err(e) => tracing::warn!(error = %e, "restart still failing"),
        }
    }

    async fn cycle(&self) -> TickOutcome {
        self.transition(DeploymentState::start_checking);

        let releases = match self
            .interruptible(self.feed.list_releases(&self.config.repo, self.config.token.as_deref()))
            .await
        {
            Ok(releases) => releases,
            Err(e) => return failed(UpdateStatus::Checking, e),
        };

        let Some(release) = ReleaseFeed::select_latest(&releases, &self.config.channel) else {
            tracing::debug!(channel = %self.config.channel, "no release on channel");
            return TickOutcome::NoRelease;
        };
        let tag = release.tag_name.clone();

        if !self.lock_state().is_new_release(&tag) {
            return TickOutcome::UpToDate { tag };
        }
        tracing::info!(tag = %tag, "new release available");

        self.transition(DeploymentState::start_downloading);
        let artifact = match self.interruptible(self.download_verified(release)).await {
            Ok(artifact) => artifact,
            Err(e) => return failed(UpdateStatus::Downloading, e),
        };

        self.transition(DeploymentState::start_applying);
        let commit = || {
            let mut state = self.lock_state();
            state.record_applied(&tag);
            state.save(&self.config.state_path).map_err(UpdateError::from)
        };

        let result = self.applier.apply(artifact, commit).await;
        match result {
            Ok(()) => {
                self.transition(DeploymentState::mark_restarted);
                tracing::info!(tag = %tag, "update applied");
                TickOutcome::Applied { tag, restarted: true }
            }
            Err(UpdateError::Restart(reason)) => {
                tracing::warn!(tag = %tag, %reason, "update applied but restart failed; will retry");
                TickOutcome::Applied { tag, restarted: false }
            }
            Err(UpdateError::State(e)) => {
                // Swapped in but not recorded: keep the restart pending until it is
                tracing::error!(tag = %tag, error = %e, "update applied but state not persisted; restart withheld");
                TickOutcome::Applied { tag, restarted: false }
            }
            Err(e) => failed(UpdateStatus::Applying, e),
        }
    }

    /// Fetch the package and pass it through the verification gate.
    async fn download_verified(&self, release: &ReleaseDescriptor) -> Result<Artifact, UpdateError> {
        let artifact = self.fetcher.fetch(release).await?;

        let checksum = self
            .fetcher
            .fetch_companion(release, &artifact.name, CHECKSUM_EXT)
            .await?;

        let signature = if self.verifier.requires_signature() {
            match self.fetcher.fetch_companion(release, &artifact.name, SIGNATURE_EXT).await {
                Ok(signature) => Some(signature),
                Err(UpdateError::AssetNotFound { .. }) => {
                    return Err(UpdateError::Verification(format!(
                        "release {} is not signed",
                        release.tag_name
                    )))
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        self.verifier
            .verify(&artifact.bytes, &checksum, signature.as_deref())?;
        tracing::info!(tag = %release.tag_name, signed = signature.is_some(), "artifact verified");
        Ok(artifact)
    }

    /// Race a network step against shutdown.
    async fn interruptible<T>(
        &self,
        step: impl Future<Output = Result<T, UpdateError>>,
    ) -> Result<T, UpdateError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            result = step => result,
            _ = wait_for_shutdown(&mut shutdown) => Err(UpdateError::Cancelled),
        }
    }

    /// Query the feed without changing anything.
    pub async fn check(&self) -> Result<CheckReport, UpdateError> {
        let releases = self
            .feed
            .list_releases(&self.config.repo, self.config.token.as_deref())
            .await?;
        let latest = ReleaseFeed::select_latest(&releases, &self.config.channel)
            .map(|release| release.tag_name.clone());
        let last_applied = self.lock_state().last_applied_tag.clone();
        let update_available = match &latest {
            Some(tag) => last_applied.as_deref() != Some(tag.as_str()),
            None => false,
        };

        Ok(CheckReport {
            channel: self.config.channel.clone(),
            latest,
            last_applied,
            update_available,
        })
    }
}

fn failed(stage: UpdateStatus, error: UpdateError) -> TickOutcome {
    if error.is_transient() {
        tracing::warn!(?stage, error = %error, "update cycle aborted, retrying next tick");
    } else {
        tracing::error!(?stage, error = %error, "update cycle failed");
    }
    TickOutcome::Failed {
        stage,
        error: error.to_string(),
    }
}

/// Resolves once `true` is published. A dropped sender never resolves.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
