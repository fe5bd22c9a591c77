//! An in-process registry for tests, served by axum on a random port.
//!
//! Besides the REST API it serves the object urls the API hands out:
//! `/exists/{hash}` answers the existence check, `/upload/{hash}` accepts gzip
//! compressed objects and `/download/{hash}` serves them with range support.

use std::{
    collections::{HashMap, HashSet},
    future::IntoFuture,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use axum::{
    body::Bytes,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use parcel_digest::{compute_bytes_digest, parse_digest_from_hex, Sha256Hash};
use parcel_registry::{RegistryClient, RegistryConfig};
use parcel_store::PackageStore;
use parcel_tree::{
    find_object_hashes, hash_contents, FileNode, GroupNode, Metadata, PackageFormat, PackageRef,
    TableNode, LATEST_TAG,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};
use url::Url;

use crate::Reporter;

/// The content of the `data` table of [`sample_tree`].
pub const D1: &str = "id,amount\n1,10\n2,20\n3,30\n";

/// The content of the `readme` file of [`sample_tree`].
pub const D2: &str = "Quarterly sales figures.\n";

/// A package with a `data` table backed by [`D1`] and a `readme` file backed
/// by [`D2`].
pub fn sample_tree() -> GroupNode {
    let metadata: Metadata = [("q_ext".to_string(), json!("csv"))].into_iter().collect();
    GroupNode::new()
        .with_child(
            "data",
            TableNode::new(
                vec![compute_bytes_digest(D1)],
                PackageFormat::Parquet,
                metadata,
            ),
        )
        .unwrap()
        .with_child(
            "readme",
            FileNode::new(compute_bytes_digest(D2), Metadata::default()),
        )
        .unwrap()
}

/// Creates a store at `root` with [`sample_tree`] installed as `alice/sales`.
pub fn local_package(root: &Path) -> (PackageStore, PackageRef, GroupNode) {
    let store = PackageStore::new(root);
    store.objects().write_bytes(D1.as_bytes()).unwrap();
    store.objects().write_bytes(D2.as_bytes()).unwrap();
    let package = PackageRef::parse_package("alice/sales").unwrap();
    let tree = sample_tree();
    store.install_tree(&package, &tree).unwrap();
    (store, package, tree)
}

/// A url nothing listens on.
pub fn unreachable_url() -> Url {
    Url::parse("http://127.0.0.1:9/").unwrap()
}

pub async fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut compressed = Vec::new();
    GzipEncoder::new(data)
        .read_to_end(&mut compressed)
        .await
        .unwrap();
    compressed
}

async fn gunzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    GzipDecoder::new(data).read_to_end(&mut decompressed).await?;
    Ok(decompressed)
}

pub struct MockRegistry {
    pub url: Url,
    pub state: Arc<MockState>,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let state = Arc::new(MockState::new(url.clone()));

        let router = Router::new()
            .route(
                "/api/package/{owner}/{name}/{hash}",
                put(push_package).get(get_package),
            )
            .route("/api/tag/{owner}/{name}/{tag}", get(get_tag).put(put_tag))
            .route("/api/version/{owner}/{name}/{version}", get(get_version))
            .route("/api/log/{owner}/{name}/", get(get_log))
            .route("/exists/{hash}", get(object_exists))
            .route("/upload/{hash}", put(upload_object))
            .route("/download/{hash}", get(download_object))
            .with_state(state.clone());
        tokio::spawn(axum::serve(listener, router).into_future());

        Self { url, state }
    }

    /// A client for this registry that retries quickly.
    pub fn client(&self) -> RegistryClient {
        RegistryClient::new(RegistryConfig {
            backoff_base: std::time::Duration::from_millis(1),
            ..RegistryConfig::with_registry_url(self.url.as_str()).unwrap()
        })
        .unwrap()
    }

    pub fn download_url(&self, hash: &Sha256Hash) -> Url {
        self.url.join(&format!("download/{hash:x}")).unwrap()
    }

    /// Starts a TCP front for this registry. The first `drops` connections
    /// are closed right after their request was read, without an answer; later
    /// connections are forwarded.
    pub async fn hang_up_front(&self, drops: usize) -> HangUpFront {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let target = format!(
            "{}:{}",
            self.url.host_str().unwrap(),
            self.url.port().unwrap()
        );
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                if counter.fetch_add(1, Ordering::SeqCst) < drops {
                    read_request_head(&mut inbound).await;
                    continue;
                }
                let target = target.clone();
                tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
            }
        });
        HangUpFront { url, connections }
    }
}

/// See [`MockRegistry::hang_up_front`].
pub struct HangUpFront {
    pub url: Url,
    /// Connections accepted so far, dropped or forwarded.
    pub connections: Arc<AtomicUsize>,
}

impl HangUpFront {
    pub fn download_url(&self, hash: &Sha256Hash) -> Url {
        self.url.join(&format!("download/{hash:x}")).unwrap()
    }
}

async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

#[derive(Default)]
struct Remote {
    objects: HashMap<Sha256Hash, Vec<u8>>,
    packages: HashMap<Sha256Hash, GroupNode>,
    tags: HashMap<String, Sha256Hash>,
    versions: HashMap<String, Sha256Hash>,
    log: Vec<(Sha256Hash, f64)>,
    rejected: HashSet<Sha256Hash>,
    flaky: HashMap<Sha256Hash, usize>,
    ranges: Vec<String>,
    download_base: Option<Url>,
}

pub struct MockState {
    base: Url,
    remote: Mutex<Remote>,
    misreport_ranges: AtomicBool,
    /// Successful object uploads.
    pub uploads: AtomicUsize,
    /// Every object upload request, including rejected ones.
    pub upload_attempts: AtomicUsize,
    /// Object download requests.
    pub downloads: AtomicUsize,
    /// Body bytes sent by object downloads.
    pub served_bytes: AtomicU64,
}

impl MockState {
    fn new(base: Url) -> Self {
        Self {
            base,
            remote: Mutex::default(),
            misreport_ranges: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
            upload_attempts: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            served_bytes: AtomicU64::new(0),
        }
    }

    pub fn insert_object(&self, content: &[u8]) -> Sha256Hash {
        let hash = compute_bytes_digest(content);
        self.remote.lock().objects.insert(hash, content.to_vec());
        hash
    }

    pub fn has_object(&self, hash: &Sha256Hash) -> bool {
        self.remote.lock().objects.contains_key(hash)
    }

    pub fn insert_package(&self, hash: Sha256Hash, tree: GroupNode) {
        let mut remote = self.remote.lock();
        remote.packages.insert(hash, tree);
        let created = remote.log.len() as f64;
        remote.log.push((hash, created));
    }

    /// Stores the sample objects and `tree` and points `latest` at the tree.
    pub fn publish(&self, tree: &GroupNode) -> GroupNode {
        self.insert_object(D1.as_bytes());
        self.insert_object(D2.as_bytes());
        let hash = hash_contents(tree);
        self.insert_package(hash, tree.clone());
        self.set_tag(LATEST_TAG, hash);
        tree.clone()
    }

    pub fn package(&self, hash: &Sha256Hash) -> Option<GroupNode> {
        self.remote.lock().packages.get(hash).cloned()
    }

    pub fn set_tag(&self, tag: &str, hash: Sha256Hash) {
        self.remote.lock().tags.insert(tag.to_string(), hash);
    }

    pub fn tag(&self, tag: &str) -> Option<Sha256Hash> {
        self.remote.lock().tags.get(tag).copied()
    }

    pub fn set_version(&self, version: &str, hash: Sha256Hash) {
        self.remote.lock().versions.insert(version.to_string(), hash);
    }

    /// Answers every upload of `hash` with 403.
    pub fn reject_upload(&self, hash: Sha256Hash) {
        self.remote.lock().rejected.insert(hash);
    }

    /// Answers the next `count` uploads of `hash` with 503.
    pub fn fail_uploads_transiently(&self, hash: Sha256Hash, count: usize) {
        self.remote.lock().flaky.insert(hash, count);
    }

    /// Makes downloads resume one byte after the requested offset.
    pub fn misreport_ranges(&self) {
        self.misreport_ranges.store(true, Ordering::SeqCst);
    }

    /// Hands out download urls below `base` instead of this registry.
    pub fn redirect_downloads_to(&self, base: Url) {
        self.remote.lock().download_base = Some(base);
    }

    /// The `Range` headers of all download requests.
    pub fn ranges(&self) -> Vec<String> {
        self.remote.lock().ranges.clone()
    }
}

type AppState = State<Arc<MockState>>;

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "message": message }))).into_response()
}

fn parse_hash(hash: &str) -> Result<Sha256Hash, Response> {
    parse_digest_from_hex(hash).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "Invalid hash" })),
        )
            .into_response()
    })
}

async fn push_package(
    State(state): AppState,
    UrlPath((_, _, hash)): UrlPath<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, Response> {
    let hash = parse_hash(&hash)?;
    assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
    let body = gunzip_bytes(&body).await.unwrap();
    let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let contents: GroupNode = serde_json::from_value(request["contents"].clone()).unwrap();
    if hash_contents(&contents) != hash {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "Hash does not match the contents" })),
        )
            .into_response());
    }

    if request["dry_run"] == json!(true) {
        let upload_urls: serde_json::Map<_, _> = find_object_hashes(&contents)
            .into_iter()
            .map(|object| {
                let head = state.base.join(&format!("exists/{object:x}")).unwrap();
                let put = state.base.join(&format!("upload/{object:x}")).unwrap();
                (format!("{object:x}"), json!({ "head": head.as_str(), "put": put.as_str() }))
            })
            .collect();
        return Ok(Json(json!({ "upload_urls": upload_urls })));
    }

    let remote = state.remote.lock();
    if let Some(missing) = find_object_hashes(&contents)
        .into_iter()
        .find(|object| !remote.objects.contains_key(object))
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": format!("Missing object {missing:x}") })),
        )
            .into_response());
    }
    drop(remote);
    state.insert_package(hash, contents);
    Ok(Json(json!({})))
}

async fn get_package(
    State(state): AppState,
    UrlPath((_, _, hash)): UrlPath<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, Response> {
    let hash = parse_hash(&hash)?;
    let remote = state.remote.lock();
    let contents = remote
        .packages
        .get(&hash)
        .ok_or_else(|| not_found("Package not found"))?;

    let subpath: Vec<&str> = query
        .get("subpath")
        .map(|subpath| subpath.split('/').filter(|c| !c.is_empty()).collect())
        .unwrap_or_default();
    let scoped = contents
        .subtree(subpath.as_slice())
        .ok_or_else(|| not_found("Subpath not found"))?;

    let base = remote.download_base.as_ref().unwrap_or(&state.base);
    let urls: serde_json::Map<_, _> = find_object_hashes(&scoped)
        .into_iter()
        .map(|object| {
            let url = base.join(&format!("download/{object:x}")).unwrap();
            (format!("{object:x}"), json!(url.as_str()))
        })
        .collect();
    Ok(Json(json!({ "urls": urls, "contents": contents })))
}

async fn get_tag(
    State(state): AppState,
    UrlPath((_, _, tag)): UrlPath<(String, String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let hash = state.tag(&tag).ok_or_else(|| not_found("Tag not found"))?;
    Ok(Json(json!({ "hash": format!("{hash:x}") })))
}

async fn put_tag(
    State(state): AppState,
    UrlPath((_, _, tag)): UrlPath<(String, String, String)>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, Response> {
    let hash = parse_hash(body["hash"].as_str().unwrap_or_default())?;
    if state.package(&hash).is_none() {
        return Err(not_found("Package not found"));
    }
    state.set_tag(&tag, hash);
    Ok(Json(json!({})))
}

async fn get_version(
    State(state): AppState,
    UrlPath((_, _, version)): UrlPath<(String, String, String)>,
) -> Result<Json<serde_json::Value>, Response> {
    let hash = state
        .remote
        .lock()
        .versions
        .get(&version)
        .copied()
        .ok_or_else(|| not_found("Version not found"))?;
    Ok(Json(json!({ "hash": format!("{hash:x}") })))
}

async fn get_log(State(state): AppState) -> Json<serde_json::Value> {
    let logs: Vec<_> = state
        .remote
        .lock()
        .log
        .iter()
        .map(|(hash, created)| {
            json!({ "hash": format!("{hash:x}"), "author": "alice", "created": created })
        })
        .collect();
    Json(json!({ "logs": logs }))
}

async fn object_exists(State(state): AppState, UrlPath(hash): UrlPath<String>) -> StatusCode {
    match parse_digest_from_hex(&hash) {
        Some(hash) if state.has_object(&hash) => StatusCode::OK,
        _ => StatusCode::NOT_FOUND,
    }
}

async fn upload_object(
    State(state): AppState,
    UrlPath(hash): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Response> {
    state.upload_attempts.fetch_add(1, Ordering::SeqCst);
    let hash = parse_hash(&hash)?;
    {
        let mut remote = state.remote.lock();
        if remote.rejected.contains(&hash) {
            return Ok(StatusCode::FORBIDDEN);
        }
        if let Some(remaining) = remote.flaky.get_mut(&hash).filter(|n| **n > 0) {
            *remaining -= 1;
            return Ok(StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
    let content = gunzip_bytes(&body).await.unwrap();
    if compute_bytes_digest(&content) != hash {
        return Ok(StatusCode::BAD_REQUEST);
    }
    state.remote.lock().objects.insert(hash, content);
    state.uploads.fetch_add(1, Ordering::SeqCst);
    Ok(StatusCode::OK)
}

async fn download_object(
    State(state): AppState,
    UrlPath(hash): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    state.downloads.fetch_add(1, Ordering::SeqCst);
    let hash = parse_hash(&hash)?;
    let content = state
        .remote
        .lock()
        .objects
        .get(&hash)
        .cloned()
        .ok_or_else(|| not_found("Object not found"))?;
    let compressed = gzip_bytes(&content).await;
    let len = compressed.len() as u64;

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let Some(range) = range else {
        state.served_bytes.fetch_add(len, Ordering::SeqCst);
        return Ok(compressed.into_response());
    };
    state.remote.lock().ranges.push(range.clone());

    let start: u64 = range
        .strip_prefix("bytes=")
        .and_then(|range| range.strip_suffix('-'))
        .and_then(|start| start.parse().ok())
        .ok_or_else(|| StatusCode::BAD_REQUEST.into_response())?;
    if start >= len {
        let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        response.headers_mut().insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes */{len}")).unwrap(),
        );
        return Ok(response);
    }

    let reported_start = if state.misreport_ranges.load(Ordering::SeqCst) {
        start + 1
    } else {
        start
    };
    let body = compressed[start as usize..].to_vec();
    state
        .served_bytes
        .fetch_add(body.len() as u64, Ordering::SeqCst);
    let mut response = (StatusCode::PARTIAL_CONTENT, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {reported_start}-{}/{len}", len - 1)).unwrap(),
    );
    Ok(response)
}

#[derive(Default)]
struct Events {
    upload_progress: (u64, u64),
    push_completed: bool,
    failed: Vec<Sha256Hash>,
    downloads_started: usize,
    downloads_completed: usize,
}

/// A [`Reporter`] that remembers what it was told.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Events>,
}

impl RecordingReporter {
    /// The last reported `(uploaded, total)` pair.
    pub fn upload_progress(&self) -> (u64, u64) {
        self.events.lock().upload_progress
    }

    pub fn push_completed(&self) -> bool {
        self.events.lock().push_completed
    }

    pub fn failed_objects(&self) -> Vec<Sha256Hash> {
        self.events.lock().failed.clone()
    }

    pub fn completed_downloads(&self) -> usize {
        self.events.lock().downloads_completed
    }
}

impl Reporter for RecordingReporter {
    fn on_push_start(&self, _package: &PackageRef, _objects: usize, total_bytes: u64) {
        self.events.lock().upload_progress = (0, total_bytes);
    }

    fn on_upload_progress(&self, uploaded: u64, total_bytes: u64) {
        // Workers report concurrently, so calls may arrive out of order.
        let mut events = self.events.lock();
        events.upload_progress = (uploaded.max(events.upload_progress.0), total_bytes);
    }

    fn on_object_skipped(&self, _hash: &Sha256Hash) {}

    fn on_object_uploaded(&self, _hash: &Sha256Hash) {}

    fn on_object_failed(&self, hash: &Sha256Hash, _error: &(dyn std::error::Error + 'static)) {
        self.events.lock().failed.push(*hash);
    }

    fn on_push_complete(&self, _package: &PackageRef, _hash: &Sha256Hash) {
        self.events.lock().push_completed = true;
    }

    fn on_install_start(&self, _package: &PackageRef, _objects: usize) {}

    fn on_object_reused(&self, _hash: &Sha256Hash) {}

    fn on_download_start(&self, _hash: &Sha256Hash) -> usize {
        let mut events = self.events.lock();
        events.downloads_started += 1;
        events.downloads_started - 1
    }

    fn on_download_progress(&self, index: usize, _progress: u64, _total: Option<u64>) {
        assert!(index < self.events.lock().downloads_started);
    }

    fn on_download_complete(&self, _index: usize) {
        self.events.lock().downloads_completed += 1;
    }

    fn on_install_complete(&self, _package: &PackageRef, _hash: &Sha256Hash) {}
}
