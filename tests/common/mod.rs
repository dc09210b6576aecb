//! Shared fixtures: an in-process release API and a recording deployer.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use companion_lib::engine::config::UpdaterConfig;
use companion_lib::engine::updater::deploy::{DeployError, Deployer, HostDeployer};
use companion_lib::engine::updater::download::Artifact;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const REPO: &str = "acme/companion";
pub const PACKAGE: &str = "companion.zip";

#[derive(Default)]
struct ReleaseStore {
    releases: Mutex<Vec<Value>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    list_hits: AtomicUsize,
    package_hits: AtomicUsize,
    list_delay: Mutex<Duration>,
    fail_list: AtomicBool,
}

/// Stand-in for the release-hosting API, listening on an ephemeral port.
#[derive(Clone)]
pub struct ReleaseServer {
    base_url: String,
    store: Arc<ReleaseStore>,
}

impl ReleaseServer {
    pub async fn start() -> Self {
        let store = Arc::new(ReleaseStore::default());
        let app = Router::new()
            .route("/repos/{owner}/{repo}/releases", get(list_releases))
            .route("/assets/{tag}/{name}", get(download_asset))
            .with_state(Arc::clone(&store));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            store,
        }
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// Publish a release as the newest entry. `assets` are served verbatim.
    pub fn publish(&self, tag: &str, assets: Vec<(String, Vec<u8>)>) {
        let listed: Vec<Value> = assets
            .iter()
            .map(|(name, _)| {
                json!({
                    "name": name,
                    "browser_download_url": format!("{}/assets/{}/{}", self.base_url, tag, name),
                })
            })
            .collect();

        {
            let mut stored = self.store.assets.lock().unwrap();
            for (name, bytes) in assets {
                stored.insert(format!("{}/{}", tag, name), bytes);
            }
        }
        self.store
            .releases
            .lock()
            .unwrap()
            .insert(0, json!({ "tag_name": tag, "assets": listed }));
    }

    /// Publish a checksummed package whose `VERSION` file holds `tag`.
    pub fn publish_package(&self, tag: &str) -> Vec<u8> {
        let package = package(tag);
        self.publish(
            tag,
            vec![
                (PACKAGE.to_string(), package.clone()),
                (format!("{}.sha256", PACKAGE), checksum_file(&package).into_bytes()),
            ],
        );
        package
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.store.list_delay.lock().unwrap() = delay;
    }

    pub fn fail_list(&self, fail: bool) {
        self.store.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn list_hits(&self) -> usize {
        self.store.list_hits.load(Ordering::SeqCst)
    }

    pub fn package_hits(&self) -> usize {
        self.store.package_hits.load(Ordering::SeqCst)
    }
}

async fn list_releases(
    State(store): State<Arc<ReleaseStore>>,
    UrlPath((owner, repo)): UrlPath<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    store.list_hits.fetch_add(1, Ordering::SeqCst);
    if format!("{}/{}", owner, repo) != REPO {
        return Err(StatusCode::NOT_FOUND);
    }
    if store.fail_list.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let delay = *store.list_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let releases = store.releases.lock().unwrap().clone();
    Ok(Json(Value::Array(releases)))
}

async fn download_asset(
    State(store): State<Arc<ReleaseStore>>,
    UrlPath((tag, name)): UrlPath<(String, String)>,
) -> Result<Vec<u8>, StatusCode> {
    if name == PACKAGE {
        store.package_hits.fetch_add(1, Ordering::SeqCst);
    }
    store
        .assets
        .lock()
        .unwrap()
        .get(&format!("{}/{}", tag, name))
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

/// Zip package with a `VERSION` file and an app entry point.
pub fn package(tag: &str) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("VERSION", options).unwrap();
        writer.write_all(tag.as_bytes()).unwrap();
        writer.start_file("server/index.js", options).unwrap();
        writer.write_all(format!("// build {}", tag).as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

/// `sha256sum`-style line for `bytes`
pub fn checksum_file(bytes: &[u8]) -> String {
    format!("{}  {}\n", hex::encode(Sha256::digest(bytes)), PACKAGE)
}

pub fn release_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn sign(key: &SigningKey, bytes: &[u8]) -> String {
    hex::encode(key.sign(bytes).to_bytes())
}

/// Updater settings pointed at `server`, deploying under `root`.
pub fn updater_config(server: &ReleaseServer, root: &Path) -> UpdaterConfig {
    let mut config = UpdaterConfig::for_live_dir(root.join("companion"));
    config.enabled = true;
    config.repo = REPO.to_string();
    config.api_url = server.url().to_string();
    config.state_path = root.join("state").join("updater.json");
    config.interval = Duration::from_millis(50);
    config.http_timeout = Duration::from_secs(5);
    config
}

pub fn seed_live(live: &Path, tag: &str) {
    fs::create_dir_all(live).unwrap();
    fs::write(live.join("VERSION"), tag).unwrap();
}

pub fn live_version(live: &Path) -> String {
    fs::read_to_string(live.join("VERSION")).unwrap()
}

/// Every file under `dir` with its contents, sorted by relative path.
pub fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut entries = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(dir).unwrap().to_path_buf();
                entries.push((rel, fs::read(&path).unwrap()));
            }
        }
    }
    entries.sort();
    entries
}

/// Real extraction and swap, with restarts recorded instead of executed.
pub struct RecordingDeployer {
    inner: HostDeployer,
    restarts: Mutex<Vec<String>>,
    extracts: AtomicUsize,
    fail_restart: AtomicBool,
}

impl RecordingDeployer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HostDeployer::new(vec![]),
            restarts: Mutex::new(vec![]),
            extracts: AtomicUsize::new(0),
            fail_restart: AtomicBool::new(false),
        })
    }

    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().unwrap().clone()
    }

    pub fn extracts(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }

    pub fn fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }
}

impl Deployer for RecordingDeployer {
    fn extract(&self, artifact: &Artifact, staging: &Path) -> Result<(), DeployError> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        self.inner.extract(artifact, staging)
    }

    fn swap(&self, staging: &Path, live: &Path) -> Result<(), DeployError> {
        self.inner.swap(staging, live)
    }

    fn restart(&self, service: &str) -> Result<(), DeployError> {
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(DeployError::Restart("supervisor unavailable".to_string()));
        }
        self.restarts.lock().unwrap().push(service.to_string());
        Ok(())
    }
}
