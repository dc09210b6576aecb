use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use companion_lib::engine::config::Config;
use companion_lib::engine::crypto::MasterKey;
use companion_lib::engine::session::{
    event_channel, CredentialBlob, DashboardEvent, SessionEvent, SessionManager,
};
use companion_lib::engine::vault::SessionVault;
use serde_json::json;
use tokio::sync::watch;

fn config_for(key: &str, vault_path: &Path) -> Config {
    let vars: HashMap<String, String> = [
        ("ENCRYPTION_KEY", key.to_string()),
        ("SESSION_VAULT_PATH", vault_path.display().to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    Config::from_lookup(move |name: &str| vars.get(name).cloned()).unwrap()
}

fn manager_for(config: &Config) -> SessionManager {
    SessionManager::new(Arc::new(SessionVault::new(
        config.vault_path.clone(),
        Arc::clone(&config.master_key),
    )))
}

#[tokio::test]
async fn test_session_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let vault_path = dir.path().join("data").join("session.vault");
    let key = MasterKey::generate().to_base64();
    let blob = CredentialBlob(json!({
        "creds": {"me": {"id": "15550001111@s.whatsapp.net"}, "registered": true},
        "keys": {"pre-key": [1, 2, 3]}
    }));

    // First run: pair and receive credentials
    {
        let config = config_for(&key, &vault_path);
        let manager = manager_for(&config);
        assert_eq!(manager.restore().unwrap(), None);

        let mut dashboard = manager.subscribe();
        let (events, queue) = event_channel();
        let (stop, shutdown) = watch::channel(false);

        events
            .send(SessionEvent::Pairing { code: "2@pairing".to_string() })
            .await
            .unwrap();
        events
            .send(SessionEvent::CredentialsChanged(blob.clone()))
            .await
            .unwrap();
        events.send(SessionEvent::Ready).await.unwrap();
        stop.send(true).unwrap();
        manager.run(queue, shutdown).await;

        assert_eq!(
            dashboard.recv().await.unwrap(),
            DashboardEvent::Pairing { code: "2@pairing".to_string() }
        );
        assert_eq!(dashboard.recv().await.unwrap(), DashboardEvent::Ready);
    }

    let on_disk = fs::read(&vault_path).unwrap();
    let needle = b"15550001111";
    assert!(!on_disk.windows(needle.len()).any(|w| w == needle));

    // Second run: same key restores the blob
    let config = config_for(&key, &vault_path);
    assert_eq!(manager_for(&config).restore().unwrap(), Some(blob));
}

#[test]
fn test_rotated_key_refuses_old_vault() {
    let dir = tempfile::tempdir().unwrap();
    let vault_path = dir.path().join("session.vault");

    let old = config_for(&MasterKey::generate().to_base64(), &vault_path);
    manager_for(&old)
        .handle(SessionEvent::CredentialsChanged(CredentialBlob(json!({"k": "v"}))))
        .unwrap();

    let rotated = config_for(&MasterKey::generate().to_base64(), &vault_path);
    let err = manager_for(&rotated).restore().unwrap_err();
    assert!(err.is_integrity());
    // The unreadable vault is left for the operator, not deleted
    assert!(vault_path.exists());
}

#[test]
fn test_auth_failure_forces_new_pairing() {
    let dir = tempfile::tempdir().unwrap();
    let vault_path = dir.path().join("session.vault");
    let config = config_for(&MasterKey::generate().to_base64(), &vault_path);
    let manager = manager_for(&config);

    manager
        .handle(SessionEvent::CredentialsChanged(CredentialBlob(json!({"k": "v"}))))
        .unwrap();
    manager
        .handle(SessionEvent::AuthFailure { reason: "device removed".to_string() })
        .unwrap();

    assert!(!vault_path.exists());
    assert_eq!(manager_for(&config).restore().unwrap(), None);
}

#[cfg(unix)]
#[test]
fn test_vault_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let vault_path = dir.path().join("session.vault");
    let config = config_for(&MasterKey::generate().to_base64(), &vault_path);
    manager_for(&config)
        .handle(SessionEvent::CredentialsChanged(CredentialBlob(json!({"k": "v"}))))
        .unwrap();

    let mode = fs::metadata(&vault_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
