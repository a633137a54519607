//! Sync cycles against a live authority on a loopback port.

#![cfg(unix)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use certferry_authority::{
    serve, BundleStore, DistributionServer, Packager, StaticResolver, WhitelistResolver,
};
use certferry_common::protocol::HEADER_CONTENT_SHA256;
use certferry_common::{ContentHash, ExclusiveLock};
use certferry_config::{AuthorityConfig, SyncConfig};
use certferry_sync::{
    CycleOutcome, PostUpdateStatus, StateStore, SyncClient, SyncError,
};

const TOKEN: &str = "shared-secret";

struct Authority {
    _root: TempDir,
    source: PathBuf,
    store: Arc<BundleStore>,
    packager: Packager,
    url: String,
    task: JoinHandle<()>,
}

impl Authority {
    /// Serves "cert" to 127.0.0.1 with token [`TOKEN`].
    async fn start() -> Self {
        let root = TempDir::new().unwrap();
        let source = root.path().join("live").join("cert");
        fs::create_dir_all(&source).unwrap();
        write_source(&source, "chain v1");

        let mut config = AuthorityConfig::default();
        config.auth.token = TOKEN.to_string();
        config.whitelist.domains = vec!["127.0.0.1".to_string()];
        config.server.bundle_dir = root.path().join("bundles");

        let store = Arc::new(BundleStore::new(config.server.bundle_dir.clone()));
        let packager = Packager::new(Arc::clone(&store), config.publish.required_files.clone());
        let whitelist = Arc::new(WhitelistResolver::new(
            &config.whitelist,
            Arc::new(StaticResolver::new()),
        ));
        whitelist.refresh_all().await;
        let server = Arc::new(
            DistributionServer::new(&config, Arc::clone(&store), whitelist).unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            serve(server, listener, std::future::pending()).await.unwrap();
        });

        let authority = Self {
            _root: root,
            source,
            store,
            packager,
            url,
            task,
        };
        authority.publish();
        authority
    }

    fn publish(&self) -> ContentHash {
        self.packager.publish(&self.source, "cert").unwrap().content_hash
    }

    fn bundle_bytes(&self) -> Vec<u8> {
        self.store.get("cert").unwrap().unwrap().payload.to_vec()
    }
}

impl Drop for Authority {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn write_source(dir: &Path, chain: &str) {
    fs::write(dir.join("fullchain.pem"), chain).unwrap();
    fs::write(dir.join("privkey.pem"), "key material").unwrap();
}

fn client_config(url: &str, root: &Path) -> SyncConfig {
    SyncConfig {
        server_url: url.to_string(),
        token: TOKEN.to_string(),
        cert_name: "cert".to_string(),
        dest_path: root.join("etc").join("cert"),
        state_dir: root.join("state"),
        timeout_secs: 5,
        retries: 1,
        backoff_secs: 0,
        ..Default::default()
    }
}

async fn spawn_router(app: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), task)
}

fn installed_hash(outcome: CycleOutcome) -> ContentHash {
    match outcome {
        CycleOutcome::Installed { hash, .. } => hash,
        other => panic!("expected an install, got {:?}", other),
    }
}

#[tokio::test]
async fn test_first_sync_installs_then_up_to_date() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let config = client_config(&authority.url, consumer.path());
    let dest = config.dest_path.clone();
    let client = SyncClient::new(config.clone()).unwrap();

    let hash = installed_hash(client.run_cycle().await.unwrap());
    assert_eq!(hash, ContentHash::of(&authority.bundle_bytes()));
    assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "chain v1");
    assert!(fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());

    let state = StateStore::new(config.state_dir.clone())
        .load("cert")
        .unwrap()
        .expect("state recorded");
    assert_eq!(state.last_installed_hash, hash);
    assert_eq!(state.dest_path, dest);

    assert_eq!(
        client.run_cycle().await.unwrap(),
        CycleOutcome::UpToDate { hash }
    );
}

#[tokio::test]
async fn test_republished_bundle_is_installed() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let config = client_config(&authority.url, consumer.path());
    let dest = config.dest_path.clone();
    let client = SyncClient::new(config).unwrap();

    let first = installed_hash(client.run_cycle().await.unwrap());

    write_source(&authority.source, "chain v2");
    let published = authority.publish();
    assert_ne!(published, first);

    let second = installed_hash(client.run_cycle().await.unwrap());
    assert_eq!(second, published);
    assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "chain v2");
}

#[tokio::test]
async fn test_post_update_runs_with_environment() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let marker = consumer.path().join("reloaded");

    let mut config = client_config(&authority.url, consumer.path());
    config.post_update = Some(format!(
        "echo \"$CERTFERRY_BUNDLE_HASH\" > {}",
        marker.display()
    ));
    let client = SyncClient::new(config).unwrap();

    match client.run_cycle().await.unwrap() {
        CycleOutcome::Installed { hash, post_update } => {
            assert_eq!(post_update, PostUpdateStatus::Succeeded);
            assert_eq!(fs::read_to_string(&marker).unwrap().trim(), hash.to_hex());
        }
        other => panic!("expected an install, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_post_update_keeps_new_version() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let mut config = client_config(&authority.url, consumer.path());
    config.post_update = Some("echo reload failed >&2; exit 3".to_string());
    let dest = config.dest_path.clone();
    let client = SyncClient::new(config).unwrap();

    match client.run_cycle().await.unwrap() {
        CycleOutcome::Installed { hash, post_update } => {
            assert!(matches!(post_update, PostUpdateStatus::Failed(_)));
            assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "chain v1");
            // Recorded as installed, so the next cycle does not reinstall
            assert_eq!(
                client.run_cycle().await.unwrap(),
                CycleOutcome::UpToDate { hash }
            );
        }
        other => panic!("expected an install, got {:?}", other),
    }
}

#[tokio::test]
async fn test_held_lock_skips_cycle() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let config = client_config(&authority.url, consumer.path());
    let dest = config.dest_path.clone();
    let lock_path = StateStore::new(config.state_dir.clone()).lock_path("cert");
    let client = SyncClient::new(config).unwrap();

    let guard = ExclusiveLock::try_acquire(&lock_path).unwrap();
    assert_eq!(client.run_cycle().await.unwrap(), CycleOutcome::Skipped);
    assert!(!dest.exists());

    drop(guard);
    installed_hash(client.run_cycle().await.unwrap());
}

#[tokio::test]
async fn test_wrong_token_installs_nothing() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let mut config = client_config(&authority.url, consumer.path());
    config.token = "not-the-token".to_string();
    let dest = config.dest_path.clone();
    let state = StateStore::new(config.state_dir.clone());
    let client = SyncClient::new(config).unwrap();

    let err = client.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized), "got {:?}", err);
    assert!(!dest.exists());
    assert!(state.load("cert").unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_certificate() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let mut config = client_config(&authority.url, consumer.path());
    config.cert_name = "missing".to_string();
    let client = SyncClient::new(config).unwrap();

    let err = client.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(ref name) if name == "missing"));
}

#[tokio::test]
async fn test_removed_destination_is_restored() {
    let authority = Authority::start().await;
    let consumer = TempDir::new().unwrap();
    let config = client_config(&authority.url, consumer.path());
    let dest = config.dest_path.clone();
    let client = SyncClient::new(config).unwrap();

    let hash = installed_hash(client.run_cycle().await.unwrap());
    fs::remove_file(&dest).unwrap();

    assert_eq!(installed_hash(client.run_cycle().await.unwrap()), hash);
    assert_eq!(fs::read_to_string(dest.join("fullchain.pem")).unwrap(), "chain v1");
}

#[tokio::test]
async fn test_hash_mismatch_installs_nothing() {
    let authority = Authority::start().await;
    let payload = authority.bundle_bytes();
    let wrong = ContentHash::of(b"something else").to_hex();

    let app = Router::new().route(
        "/api/v1/:cert_name",
        get(move || {
            let payload = payload.clone();
            let wrong = wrong.clone();
            async move {
                Response::builder()
                    .status(StatusCode::OK)
                    .header(HEADER_CONTENT_SHA256, wrong)
                    .body(Body::from(payload))
                    .unwrap()
            }
        }),
    );
    let (url, task) = spawn_router(app).await;

    let consumer = TempDir::new().unwrap();
    let config = client_config(&url, consumer.path());
    let dest = config.dest_path.clone();
    let client = SyncClient::new(config).unwrap();

    let err = client.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Integrity { .. }), "got {:?}", err);
    assert!(!dest.exists());
    task.abort();
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let authority = Authority::start().await;
    let payload = authority.bundle_bytes();
    let hash = ContentHash::of(&payload);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let app = Router::new().route(
        "/api/v1/:cert_name",
        get(move || {
            let payload = payload.clone();
            let calls = Arc::clone(&counter);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Response::builder()
                        .status(StatusCode::SERVICE_UNAVAILABLE)
                        .body(Body::empty())
                        .unwrap();
                }
                Response::builder()
                    .status(StatusCode::OK)
                    .header(HEADER_CONTENT_SHA256, ContentHash::of(&payload).to_hex())
                    .body(Body::from(payload))
                    .unwrap()
            }
        }),
    );
    let (url, task) = spawn_router(app).await;

    let consumer = TempDir::new().unwrap();
    let mut config = client_config(&url, consumer.path());
    config.retries = 3;
    let client = SyncClient::new(config).unwrap();

    assert_eq!(installed_hash(client.run_cycle().await.unwrap()), hash);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    task.abort();
}

#[tokio::test]
async fn test_server_error_without_retries_fails() {
    let app = Router::new().route(
        "/api/v1/:cert_name",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let (url, task) = spawn_router(app).await;

    let consumer = TempDir::new().unwrap();
    let client = SyncClient::new(client_config(&url, consumer.path())).unwrap();

    let err = client.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Server(500)), "got {:?}", err);
    task.abort();
}
