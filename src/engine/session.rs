//! Companion Session Module
//! Bridges the messaging client to the session vault and the dashboard

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use super::vault::{SessionVault, VaultError};

const EVENT_QUEUE: usize = 64;
const DASHBOARD_BACKLOG: usize = 32;

/// Opaque authentication state owned by the messaging client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialBlob(pub serde_json::Value);

/// Events emitted by the messaging client
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// New pairing code to show on the dashboard
    Pairing { code: String },
    /// Credentials were issued or rotated
    CredentialsChanged(CredentialBlob),
    Ready,
    /// The network rejected the stored session
    AuthFailure { reason: String },
    Disconnected { reason: String },
}

/// Events relayed to dashboard subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DashboardEvent {
    Pairing { code: String },
    Ready,
    AuthFailure { reason: String },
    Disconnected { reason: String },
}

/// Queue the messaging client pushes its events into.
pub fn event_channel() -> (mpsc::Sender<SessionEvent>, mpsc::Receiver<SessionEvent>) {
    mpsc::channel(EVENT_QUEUE)
}

pub struct SessionManager {
    vault: Arc<SessionVault>,
    dashboard: broadcast::Sender<DashboardEvent>,
}

impl SessionManager {
    pub fn new(vault: Arc<SessionVault>) -> Self {
        let (dashboard, _) = broadcast::channel(DASHBOARD_BACKLOG);
        Self { vault, dashboard }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.dashboard.subscribe()
    }

    /// Load the credentials saved by a previous run.
    ///
    /// Any error here means the stored session cannot be trusted and the
    /// messaging client must not start.
    pub fn restore(&self) -> Result<Option<CredentialBlob>, VaultError> {
        let blob = self.vault.load::<CredentialBlob>()?;
        match &blob {
            Some(_) => tracing::info!(path = %self.vault.path().display(), "restored saved session"),
            None => tracing::info!("no saved session, pairing required"),
        }
        Ok(blob)
    }

    /// Apply a single event.
    pub fn handle(&self, event: SessionEvent) -> Result<(), VaultError> {
        match event {
            SessionEvent::CredentialsChanged(blob) => {
                self.vault.save(&blob)?;
                tracing::info!("session credentials persisted");
            }
            SessionEvent::Pairing { code } => {
                tracing::debug!("pairing code issued");
                self.publish(DashboardEvent::Pairing { code });
            }
            SessionEvent::Ready => {
                tracing::info!("messaging client ready");
                self.publish(DashboardEvent::Ready);
            }
            SessionEvent::AuthFailure { reason } => {
                tracing::error!(%reason, "authentication failure, discarding saved session");
                self.vault.purge()?;
                self.publish(DashboardEvent::AuthFailure { reason });
            }
            SessionEvent::Disconnected { reason } => {
                tracing::warn!(%reason, "messaging client disconnected");
                self.publish(DashboardEvent::Disconnected { reason });
            }
        }
        Ok(())
    }

    fn publish(&self, event: DashboardEvent) {
        // No subscribers is fine
        let _ = self.dashboard.send(event);
    }

    /// Process events one at a time until shutdown, then drain what is queued
    /// so the latest credentials are not lost.
    pub async fn run(&self, mut events: mpsc::Receiver<SessionEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                stopped = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
                    if stopped {
                        break;
                    }
                    // Sender gone without a stop signal: keep serving events
                    match events.recv().await {
                        Some(event) => self.handle_logged(event),
                        None => return,
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_logged(event),
                    None => return,
                },
            }
        }

        while let Ok(event) = events.try_recv() {
            self.handle_logged(event);
        }
    }

    fn handle_logged(&self, event: SessionEvent) {
        if let Err(e) = self.handle(event) {
            tracing::error!(error = %e, "session event handling failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::crypto::MasterKey;
    use serde_json::json;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> (SessionManager, Arc<SessionVault>) {
        let vault = Arc::new(SessionVault::new(
            dir.join("session.vault"),
            Arc::new(MasterKey::generate()),
        ));
        (SessionManager::new(Arc::clone(&vault)), vault)
    }

    #[test]
    fn test_restore_empty() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        assert!(manager.restore().unwrap().is_none());
    }

    #[test]
    fn test_credentials_persist_and_restore() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let blob = CredentialBlob(json!({"clientId": "companion", "keys": [1, 2, 3]}));

        manager.handle(SessionEvent::CredentialsChanged(blob.clone())).unwrap();
        assert_eq!(manager.restore().unwrap(), Some(blob));
    }

    #[test]
    fn test_restore_propagates_integrity_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.vault");
        SessionVault::new(&path, Arc::new(MasterKey::generate()))
            .save(&json!({"k": "v"}))
            .unwrap();

        let manager = SessionManager::new(Arc::new(SessionVault::new(
            &path,
            Arc::new(MasterKey::generate()),
        )));
        let err = manager.restore().unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_auth_failure_purges_and_notifies() {
        let dir = tempdir().unwrap();
        let (manager, vault) = manager(dir.path());
        let mut dashboard = manager.subscribe();

        manager
            .handle(SessionEvent::CredentialsChanged(CredentialBlob(json!({"k": "v"}))))
            .unwrap();
        assert!(vault.exists());

        manager
            .handle(SessionEvent::AuthFailure { reason: "logged out".to_string() })
            .unwrap();
        assert!(!vault.exists());
        assert_eq!(
            dashboard.try_recv().unwrap(),
            DashboardEvent::AuthFailure { reason: "logged out".to_string() }
        );
    }

    #[test]
    fn test_pairing_relayed_to_dashboard() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let mut dashboard = manager.subscribe();

        manager.handle(SessionEvent::Pairing { code: "2@abc,def".to_string() }).unwrap();
        manager.handle(SessionEvent::Ready).unwrap();

        assert_eq!(
            dashboard.try_recv().unwrap(),
            DashboardEvent::Pairing { code: "2@abc,def".to_string() }
        );
        assert_eq!(dashboard.try_recv().unwrap(), DashboardEvent::Ready);
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_shutdown() {
        let dir = tempdir().unwrap();
        let (manager, vault) = manager(dir.path());
        let (events_tx, events_rx) = event_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        events_tx
            .send(SessionEvent::CredentialsChanged(CredentialBlob(json!({"v": 1}))))
            .await
            .unwrap();
        events_tx
            .send(SessionEvent::CredentialsChanged(CredentialBlob(json!({"v": 2}))))
            .await
            .unwrap();
        stop_tx.send(true).unwrap();

        manager.run(events_rx, stop_rx).await;

        let saved: Option<CredentialBlob> = vault.load().unwrap();
        assert_eq!(saved, Some(CredentialBlob(json!({"v": 2}))));
    }

    #[tokio::test]
    async fn test_run_ends_when_client_goes_away() {
        let dir = tempdir().unwrap();
        let (manager, vault) = manager(dir.path());
        let (events_tx, events_rx) = event_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);

        events_tx
            .send(SessionEvent::CredentialsChanged(CredentialBlob(json!({"v": 3}))))
            .await
            .unwrap();
        drop(events_tx);

        manager.run(events_rx, stop_rx).await;
        let saved: Option<CredentialBlob> = vault.load().unwrap();
        assert_eq!(saved, Some(CredentialBlob(json!({"v": 3}))));
    }

    #[tokio::test]
    async fn test_run_as_spawned_task() {
        let dir = tempdir().unwrap();
        let (manager, vault) = manager(dir.path());
        let manager = Arc::new(manager);
        let (events_tx, events_rx) = event_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run(events_rx, stop_rx).await })
        };

        events_tx
            .send(SessionEvent::CredentialsChanged(CredentialBlob(json!({"v": 4}))))
            .await
            .unwrap();
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let saved: Option<CredentialBlob> = vault.load().unwrap();
        assert_eq!(saved, Some(CredentialBlob(json!({"v": 4}))));
    }

    #[test]
    fn test_dashboard_event_json() {
        let event = DashboardEvent::Pairing { code: "xyz".to_string() };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "pairing", "code": "xyz"})
        );
    }
}
