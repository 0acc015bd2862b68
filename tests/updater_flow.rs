//! End-to-end update cycles against a local HTTP server
#![cfg(unix)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256, Sha512};
use tempfile::TempDir;
use tokio::sync::mpsc;

use eonplay_updater::signing::SIGNATURE_CONTEXT;
use eonplay_updater::{
    Channel, Config, ErrorKind, StaticVersion, Updater, UpdaterEvent, UpdaterService,
    UpdaterState,
};

const RELEASE: &[u8] = b"EonPlay 1.1.0 release build";

#[derive(Clone)]
struct AppState {
    manifest: Arc<String>,
    files: Arc<HashMap<String, Vec<u8>>>,
    queries: Arc<Mutex<Vec<String>>>,
}

async fn manifest(
    State(state): State<AppState>,
    UrlPath(_channel): UrlPath<String>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    if let Some(query) = query {
        state.queries.lock().unwrap().push(query);
    }
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.manifest.as_str().to_owned(),
    )
}

async fn file(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> Response {
    if name == "stalled.bin" {
        let first = futures_util::stream::once(async {
            Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 1024]))
        });
        let stream = futures_util::StreamExt::chain(first, futures_util::stream::pending());
        return Body::from_stream(stream).into_response();
    }

    match state.files.get(&name) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

struct Server {
    base: String,
    queries: Arc<Mutex<Vec<String>>>,
}

/// Serve a manifest built from the server's base URL
async fn serve<F>(build: F) -> Server
where
    F: FnOnce(&str) -> (serde_json::Value, HashMap<String, Vec<u8>>),
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (manifest_json, files) = build(&base);

    let queries = Arc::new(Mutex::new(Vec::new()));
    let state = AppState {
        manifest: Arc::new(manifest_json.to_string()),
        files: Arc::new(files),
        queries: queries.clone(),
    };
    let app = Router::new()
        .route("/:channel/manifest", get(manifest))
        .route("/files/:name", get(file))
        .with_state(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server { base, queries }
}

fn release_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

fn entry(base: &str, version: &str, file: &str, signed: &[u8], served: &[u8]) -> serde_json::Value {
    let signature = release_key()
        .sign_prehashed(Sha512::new().chain_update(signed), Some(SIGNATURE_CONTEXT))
        .unwrap();

    serde_json::json!({
        "version": version,
        "build": "20240115",
        "releaseDate": "2024-01-15T10:00:00Z",
        "url": format!("{}/files/{}", base, file),
        "signature": hex::encode(signature.to_bytes()),
        "checksum": format!("sha256:{}", hex::encode(Sha256::digest(signed))),
        "size": served.len(),
        "notes": "Faster seeking",
        "platforms": ["linux-x86_64", "windows-x86_64"],
    })
}

/// Manifest offering 1.1.0 whose artifact is `served`, signed over `signed`
fn single_release(base: &str, signed: &[u8], served: &[u8]) -> (serde_json::Value, HashMap<String, Vec<u8>>) {
    let manifest = serde_json::json!({
        "entries": [entry(base, "1.1.0", "EonPlay-1.1.0.bin", signed, served)]
    });
    let files = HashMap::from([("EonPlay-1.1.0.bin".to_string(), served.to_vec())]);
    (manifest, files)
}

struct Install {
    _root: TempDir,
    root: PathBuf,
}

impl Install {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().to_path_buf();
        std::fs::create_dir_all(path.join("install/lib")).unwrap();
        std::fs::write(path.join("install/eonplay"), "v1").unwrap();
        std::fs::write(path.join("install/lib/libcodec.so"), "codec v1").unwrap();
        Self { _root: root, root: path }
    }

    fn config(&self, base: &str) -> Config {
        let mut config = Config::default();
        config.server.url = base.to_string();
        config.server.allow_http = true;
        config.server.platform = Some("linux-x86_64".to_string());
        config.signing.public_key = Some(hex::encode(release_key().verifying_key().to_bytes()));
        config.paths.install_dir = self.root.join("install");
        config.paths.download_dir = self.root.join("downloads");
        config.paths.backup_dir = self.root.join("backups");
        config.paths.state_file = self.root.join("state.json");
        config.timeouts.download_secs = 20;
        config.timeouts.installer_secs = 20;
        config.schedule.automatic_check = false;
        config.policy.user_consent = true;
        config.policy.automatic_install = true;
        config.installer.command = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "cp {artifact} {install_dir}/eonplay".to_string(),
        ]);
        config
    }

    fn file(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn download_dir_entries(&self) -> Vec<PathBuf> {
        list_dir(&self.file("downloads"))
    }

    fn backups(&self) -> Vec<PathBuf> {
        list_dir(&self.file("backups"))
    }
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<UpdaterEvent>) -> Vec<UpdaterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn states(events: &[UpdaterEvent]) -> Vec<UpdaterState> {
    events
        .iter()
        .filter_map(|e| match e {
            UpdaterEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

fn position(events: &[UpdaterEvent], name: &str) -> usize {
    events
        .iter()
        .position(|e| e.name() == name)
        .unwrap_or_else(|| panic!("no {} event", name))
}

#[tokio::test]
async fn happy_path_installs_and_prunes() {
    let server = serve(|base| single_release(base, RELEASE, RELEASE)).await;
    let install = Install::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater =
        Updater::new(install.config(&server.base), tx, StaticVersion("1.0.0".to_string()))
            .unwrap();

    updater.run_cycle().await.unwrap();

    assert_eq!(updater.state(), UpdaterState::Completed);
    assert_eq!(updater.installed_version(), "1.1.0");
    assert_eq!(
        std::fs::read(install.file("install/eonplay")).unwrap(),
        RELEASE
    );
    assert!(install.download_dir_entries().is_empty());
    assert_eq!(install.backups().len(), 1);
    assert_eq!(
        std::fs::read_to_string(install.backups()[0].join("eonplay")).unwrap(),
        "v1"
    );

    let events = drain(&mut rx);
    assert_eq!(
        states(&events),
        vec![
            UpdaterState::Checking,
            UpdaterState::Available,
            UpdaterState::Downloading,
            UpdaterState::Installing,
            UpdaterState::Completed,
        ]
    );
    assert!(position(&events, "download-completed") < position(&events, "install-started"));
    assert!(position(&events, "install-completed") < events.len() - 1);

    let mut last = 0;
    for event in &events {
        if let UpdaterEvent::DownloadProgress(p) = event {
            assert!(p.bytes_received >= last);
            assert!(p.bytes_received <= p.total_bytes);
            assert!(p.percent <= 100);
            last = p.bytes_received;
        }
    }
    assert_eq!(last, RELEASE.len() as u64);

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(install.file("state.json")).unwrap())
            .unwrap();
    assert_eq!(saved["installedVersion"], "1.1.0");
    assert!(saved["lastCheckTime"].is_string());

    let queries = server.queries.lock().unwrap().clone();
    assert_eq!(queries, vec!["platform=linux-x86_64&current=1.0.0".to_string()]);
}

#[tokio::test]
async fn signature_mismatch_never_reaches_installer() {
    let tampered = b"EonPlay 1.1.0 release build, tampered";
    // Checksum matches the served bytes; the signature covers the genuine build
    let server = serve(|base| {
        let mut manifest = single_release(base, RELEASE, tampered);
        manifest.0["entries"][0]["checksum"] =
            serde_json::json!(format!("sha256:{}", hex::encode(Sha256::digest(tampered))));
        manifest
    })
    .await;
    let install = Install::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater =
        Updater::new(install.config(&server.base), tx, StaticVersion("1.0.0".to_string()))
            .unwrap();

    let err = updater.run_cycle().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Verification);
    assert_eq!(updater.state(), UpdaterState::Failed);
    let last_error = updater.last_error().unwrap();
    assert_eq!(last_error.kind, ErrorKind::Verification);
    assert!(last_error.message.to_lowercase().contains("verification"));
    assert!(install.download_dir_entries().is_empty());
    assert!(install.backups().is_empty());
    assert_eq!(std::fs::read_to_string(install.file("install/eonplay")).unwrap(), "v1");

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| e.name() == "install-started"));
    assert!(matches!(events.last(), Some(UpdaterEvent::Failed(_))));
}

#[tokio::test]
async fn checksum_mismatch_fails_verification() {
    let server = serve(|base| {
        let mut manifest = single_release(base, RELEASE, RELEASE);
        manifest.0["entries"][0]["checksum"] =
            serde_json::json!(format!("sha256:{}", "0".repeat(64)));
        manifest
    })
    .await;
    let install = Install::new();
    let mut updater = Updater::new(
        install.config(&server.base),
        eonplay_updater::LogSink,
        StaticVersion("1.0.0".to_string()),
    )
    .unwrap();

    updater.run_cycle().await.unwrap_err();
    assert_eq!(updater.failure().unwrap().kind, ErrorKind::Verification);
    assert!(install.download_dir_entries().is_empty());
}

#[tokio::test]
async fn installer_failure_rolls_back() {
    let server = serve(|base| single_release(base, RELEASE, RELEASE)).await;
    let install = Install::new();
    let mut config = install.config(&server.base);
    config.installer.command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo half-installed > {install_dir}/eonplay; rm -rf {install_dir}/lib; exit 3".to_string(),
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater = Updater::new(config, tx, StaticVersion("1.0.0".to_string())).unwrap();

    let err = updater.run_cycle().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Installer);
    assert_eq!(updater.state(), UpdaterState::Failed);
    let failure = updater.failure().unwrap();
    assert!(failure.rolled_back);
    assert!(!failure.critical);
    assert_eq!(updater.installed_version(), "1.0.0");
    assert_eq!(std::fs::read_to_string(install.file("install/eonplay")).unwrap(), "v1");
    assert_eq!(
        std::fs::read_to_string(install.file("install/lib/libcodec.so")).unwrap(),
        "codec v1"
    );

    let events = drain(&mut rx);
    assert_eq!(
        states(&events),
        vec![
            UpdaterState::Checking,
            UpdaterState::Available,
            UpdaterState::Downloading,
            UpdaterState::Installing,
            UpdaterState::Rollback,
            UpdaterState::Failed,
        ]
    );
    assert!(events.iter().any(|e| *e == UpdaterEvent::RolledBack));

    assert!(updater.reset());
    assert_eq!(updater.state(), UpdaterState::Idle);
}

#[tokio::test]
async fn cancel_mid_download_returns_to_idle() {
    let server = serve(|base| {
        let mut stalled = entry(base, "1.1.0", "stalled.bin", RELEASE, &[0u8; 4096]);
        stalled["size"] = serde_json::json!(1024 * 1024);
        (serde_json::json!({ "entries": [stalled] }), HashMap::new())
    })
    .await;
    let install = Install::new();
    let (tx, mut events) = mpsc::unbounded_channel();
    let updater =
        Updater::new(install.config(&server.base), tx, StaticVersion("1.0.0".to_string()))
            .unwrap();
    let (service, handle) = UpdaterService::new(updater);
    let task = tokio::spawn(service.run());

    handle.check();
    while let Some(event) = events.recv().await {
        if matches!(event, UpdaterEvent::DownloadProgress(_)) {
            break;
        }
    }
    assert!(install.file("downloads/stalled.bin.partial").exists());

    handle.cancel();
    let state = handle.wait_for(|s| *s == UpdaterState::Idle).await;
    assert_eq!(state, Some(UpdaterState::Idle));

    handle.shutdown();
    let updater = task.await.unwrap();
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert!(updater.update_info().is_none());
    assert!(updater.progress().is_none());
    assert!(install.download_dir_entries().is_empty());
    assert!(install.backups().is_empty());
}

#[tokio::test]
async fn channel_filters_prereleases() {
    let server = serve(|base| {
        let manifest = serde_json::json!({
            "entries": [
                entry(base, "1.1.0-beta", "EonPlay-1.1.0-beta.bin", RELEASE, RELEASE),
                entry(base, "1.0.5", "EonPlay-1.0.5.bin", RELEASE, RELEASE),
            ]
        });
        (manifest, HashMap::new())
    })
    .await;
    let install = Install::new();

    let mut config = install.config(&server.base);
    config.server.channel = Channel::Stable;
    let mut stable =
        Updater::new(config.clone(), eonplay_updater::LogSink, StaticVersion("1.0.0".into()))
            .unwrap();
    let offer = stable.check_for_updates().await.unwrap().unwrap();
    assert_eq!(offer.version, "1.0.5");
    assert_eq!(stable.state(), UpdaterState::Available);

    config.server.channel = Channel::Beta;
    let mut beta =
        Updater::new(config, eonplay_updater::LogSink, StaticVersion("1.0.0".into())).unwrap();
    let offer = beta.check_for_updates().await.unwrap().unwrap();
    assert_eq!(offer.version, "1.1.0-beta");
}

#[tokio::test]
async fn nothing_newer_stays_idle() {
    let server = serve(|base| {
        let manifest = serde_json::json!({
            "entries": [entry(base, "1.0.0", "EonPlay-1.0.0.bin", RELEASE, RELEASE)]
        });
        (manifest, HashMap::new())
    })
    .await;
    let install = Install::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater =
        Updater::new(install.config(&server.base), tx, StaticVersion("1.0.0".to_string()))
            .unwrap();

    assert!(updater.check_for_updates().await.unwrap().is_none());
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert!(updater.last_error().is_none());

    let events = drain(&mut rx);
    assert!(events.contains(&UpdaterEvent::CheckCompleted(false)));
    assert_eq!(states(&events), vec![UpdaterState::Checking, UpdaterState::Idle]);
}

#[tokio::test]
async fn malformed_manifest_is_recorded() {
    let server = serve(|_| (serde_json::json!("not a manifest"), HashMap::new())).await;
    let install = Install::new();
    let mut updater = Updater::new(
        install.config(&server.base),
        eonplay_updater::LogSink,
        StaticVersion("1.0.0".to_string()),
    )
    .unwrap();

    updater.run_cycle().await.unwrap();
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert_eq!(updater.last_error().unwrap().kind, ErrorKind::Parse);
    assert!(updater.last_check_time().is_some());
}

#[tokio::test]
async fn missing_consent_blocks_automatic_progress() {
    let server = serve(|base| single_release(base, RELEASE, RELEASE)).await;
    let install = Install::new();
    let mut config = install.config(&server.base);
    config.policy.user_consent = false;
    let mut updater = Updater::new(config, eonplay_updater::LogSink, StaticVersion("1.0.0".into()))
        .unwrap();

    updater.run_cycle().await.unwrap();

    assert_eq!(updater.state(), UpdaterState::Available);
    assert_eq!(updater.last_error().unwrap().kind, ErrorKind::Policy);
    assert!(install.download_dir_entries().is_empty());

    updater.set_user_consent(true);
    updater.proceed_until(std::future::pending()).await.unwrap();
    assert_eq!(updater.state(), UpdaterState::Completed);
    assert!(updater.last_error().is_none());
}

#[tokio::test]
async fn manual_install_after_verified_download() {
    let server = serve(|base| single_release(base, RELEASE, RELEASE)).await;
    let install = Install::new();
    let mut config = install.config(&server.base);
    config.policy.automatic_install = false;
    let mut updater = Updater::new(config, eonplay_updater::LogSink, StaticVersion("1.0.0".into()))
        .unwrap();

    updater.run_cycle().await.unwrap();
    assert_eq!(updater.state(), UpdaterState::Available);
    let artifact = updater.verified_artifact().unwrap();
    assert_eq!(artifact, install.file("downloads/EonPlay-1.1.0.bin"));
    assert!(artifact.exists());

    updater.install_update().await.unwrap();
    assert_eq!(updater.state(), UpdaterState::Completed);
    assert!(!artifact.exists());
}

#[tokio::test]
async fn oversized_body_fails_download() {
    let server = serve(|base| {
        let mut manifest = single_release(base, RELEASE, RELEASE);
        manifest.0["entries"][0]["size"] = serde_json::json!(8);
        manifest
    })
    .await;
    let install = Install::new();
    let mut updater = Updater::new(
        install.config(&server.base),
        eonplay_updater::LogSink,
        StaticVersion("1.0.0".to_string()),
    )
    .unwrap();

    let err = updater.run_cycle().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(updater.state(), UpdaterState::Failed);
    assert!(install.download_dir_entries().is_empty());
}

#[tokio::test]
async fn untrusted_updater_rejects_everything() {
    let server = serve(|base| single_release(base, RELEASE, RELEASE)).await;
    let install = Install::new();
    let mut config = install.config(&server.base);
    config.signing.public_key = None;
    let mut updater = Updater::new(config, eonplay_updater::LogSink, StaticVersion("1.0.0".into()))
        .unwrap();

    let err = updater.run_cycle().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Verification);
    assert_eq!(std::fs::read_to_string(install.file("install/eonplay")).unwrap(), "v1");
}

#[tokio::test]
async fn manifest_error_status_means_no_update() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new().route(
        "/:channel/manifest",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let install = Install::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater =
        Updater::new(install.config(&base), tx, StaticVersion("1.0.0".to_string())).unwrap();

    assert!(updater.check_for_updates().await.unwrap().is_none());
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert!(updater.last_error().is_none());
    assert!(updater.last_check_time().is_some());

    let events = drain(&mut rx);
    assert!(events.contains(&UpdaterEvent::CheckCompleted(false)));
    assert_eq!(states(&events), vec![UpdaterState::Checking, UpdaterState::Idle]);
}

#[tokio::test]
async fn stalled_download_times_out() {
    let server = serve(|base| {
        let mut stalled = entry(base, "1.1.0", "stalled.bin", RELEASE, &[0u8; 4096]);
        stalled["size"] = serde_json::json!(1024 * 1024);
        (serde_json::json!({ "entries": [stalled] }), HashMap::new())
    })
    .await;
    let install = Install::new();
    let mut config = install.config(&server.base);
    config.timeouts.download_secs = 1;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater = Updater::new(config, tx, StaticVersion("1.0.0".to_string())).unwrap();

    let err = updater.run_cycle().await.unwrap_err();

    assert!(matches!(err, eonplay_updater::UpdateError::Timeout(1)));
    assert_eq!(updater.state(), UpdaterState::Failed);
    let last_error = updater.last_error().unwrap();
    assert_eq!(last_error.kind, ErrorKind::Transport);
    assert!(last_error.message.contains("timed out"));
    assert!(!install.file("downloads/stalled.bin.partial").exists());
    assert!(install.download_dir_entries().is_empty());
    assert!(install.backups().is_empty());

    let events = drain(&mut rx);
    assert_eq!(
        states(&events),
        vec![
            UpdaterState::Checking,
            UpdaterState::Available,
            UpdaterState::Downloading,
            UpdaterState::Failed,
        ]
    );
}

#[tokio::test]
async fn backup_failure_stops_before_installer() {
    let server = serve(|base| single_release(base, RELEASE, RELEASE)).await;
    let install = Install::new();
    let marker = install.file("installer-ran");
    let mut config = install.config(&server.base);
    config.installer.command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("touch {}", marker.display()),
    ]);
    std::fs::remove_dir_all(install.file("install")).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater = Updater::new(config, tx, StaticVersion("1.0.0".to_string())).unwrap();

    let err = updater.run_cycle().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FileSystem);
    assert_eq!(updater.state(), UpdaterState::Failed);
    let failure = updater.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::FileSystem);
    assert!(!failure.rolled_back);
    assert!(!failure.critical);
    assert!(!marker.exists());
    assert_eq!(updater.installed_version(), "1.0.0");

    let events = drain(&mut rx);
    let seen = states(&events);
    assert!(!seen.contains(&UpdaterState::Rollback));
    assert_eq!(seen.last(), Some(&UpdaterState::Failed));
    assert!(!events.iter().any(|e| *e == UpdaterEvent::RolledBack));
}

#[tokio::test]
async fn failed_restore_is_critical() {
    let server = serve(|base| single_release(base, RELEASE, RELEASE)).await;
    let install = Install::new();
    let mut config = install.config(&server.base);
    // The installer wrecks the snapshot it would be rolled back from
    config.installer.command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("rm -rf {}/*; exit 1", install.file("backups").display()),
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut updater = Updater::new(config, tx, StaticVersion("1.0.0".to_string())).unwrap();

    let err = updater.run_cycle().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Installer);
    assert_eq!(updater.state(), UpdaterState::Failed);
    let failure = updater.failure().unwrap();
    assert!(failure.critical);
    assert!(!failure.rolled_back);
    assert_eq!(std::fs::read_to_string(install.file("install/eonplay")).unwrap(), "v1");

    let events = drain(&mut rx);
    let seen = states(&events);
    assert_eq!(
        &seen[seen.len() - 3..],
        &[UpdaterState::Installing, UpdaterState::Rollback, UpdaterState::Failed]
    );
    assert!(!events.iter().any(|e| *e == UpdaterEvent::RolledBack));
}
