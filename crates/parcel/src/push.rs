//! Pushing a locally installed package to the registry.
//!
//! A push is two-phase. A dry run first negotiates an upload url for every
//! object of the tree, a pool of workers then makes sure every object is
//! stored remotely, and only after all of them succeeded the tree itself is
//! pushed and the `latest` tag is moved. A reader can therefore never observe
//! a tree that references missing objects.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use async_compression::tokio::bufread::GzipEncoder;
use fs_err::tokio as fs;
use futures::{stream::FuturesUnordered, StreamExt, TryStreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use parcel_digest::Sha256Hash;
use parcel_registry::{
    check_status, retry::wait_for_retry, PushRequest, RegistryClient, RegistryError, UploadUrls,
};
use parcel_store::{PackageStore, StoreError};
use parcel_tree::{find_object_hashes, hash_contents, PackageRef, LATEST_TAG};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::io::ReaderStream;
use url::Url;

use crate::Reporter;

/// Options that control a push.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Make the pushed package readable by everyone.
    pub public: bool,

    /// Upload every object, even the ones the registry reports as present.
    pub reupload: bool,

    /// A free-form description stored with the package instance.
    pub description: String,
}

/// The outcome of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// The package hash that was pushed and that `latest` now points at.
    pub hash: Sha256Hash,

    /// The number of objects that were transferred.
    pub uploaded: usize,

    /// The number of objects the registry already stored.
    pub skipped: usize,
}

/// An error that occurred while pushing a package.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// There is no local record for the package.
    #[error("{0} is not installed locally")]
    NotInstalled(PackageRef),

    /// The local store could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A registry call failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Some objects could not be uploaded. The tree was not pushed.
    #[error("failed to upload {failed} of {total} objects")]
    UploadsFailed {
        /// The number of objects that failed.
        failed: usize,
        /// The number of objects the tree references.
        total: usize,
    },
}

/// An error that occurred while uploading a single object.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The dry run did not hand out an upload url for the object.
    #[error("the registry did not provide an upload url for {0:x}")]
    MissingUrl(Sha256Hash),

    /// The object could not be read or compressed.
    #[error("failed to prepare the object for upload")]
    Io(#[from] std::io::Error),

    /// The transfer failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl UploadError {
    fn is_transient(&self) -> bool {
        matches!(self, UploadError::Registry(err) if err.is_transient())
    }
}

/// Pushes the locally installed tree of `package` and points the `latest`
/// tag at it. A subpath of `package` is ignored; the whole package is pushed.
pub async fn push(
    store: &PackageStore,
    registry: &RegistryClient,
    package: &PackageRef,
    options: &PushOptions,
    reporter: Option<Arc<dyn Reporter>>,
) -> Result<PushResult, PushError> {
    let package = package.package();
    let record = store
        .get_package(&package)?
        .ok_or_else(|| PushError::NotInstalled(package.clone()))?;
    let contents = &record.contents;
    let hash = hash_contents(contents);

    let required = find_object_hashes(contents);
    let mut sizes = HashMap::with_capacity(required.len());
    for object in &required {
        sizes.insert(*object, store.objects().object_size_async(object).await?);
    }
    let total_bytes: u64 = sizes.values().sum();

    let negotiation = registry
        .push_package(
            &package,
            &hash,
            &PushRequest {
                dry_run: true,
                public: options.public,
                contents,
                description: &options.description,
            },
        )
        .await?;

    if let Some(reporter) = &reporter {
        reporter.on_push_start(&package, required.len(), total_bytes);
    }
    tracing::info!(
        "pushing {package} at {hash:x}: {} objects, {total_bytes} bytes",
        required.len()
    );

    // Popping from the back hands out the objects in ascending order.
    let mut queue: Vec<Sha256Hash> = required.iter().copied().collect();
    queue.reverse();

    let context = UploadContext {
        store,
        registry,
        reupload: options.reupload,
        upload_urls: &negotiation.upload_urls,
        sizes: &sizes,
        queue: Mutex::new(queue),
        progress: Arc::new(PushProgress {
            uploaded: AtomicU64::new(0),
            total_bytes,
            reporter: reporter.clone(),
        }),
    };

    let worker_count = registry.config().upload_concurrency.min(required.len());
    let mut workers = (0..worker_count)
        .map(|_| upload_worker(&context))
        .collect::<FuturesUnordered<_>>();

    let mut stats = WorkerStats::default();
    while let Some(worker_stats) = workers.next().await {
        stats.uploaded += worker_stats.uploaded;
        stats.skipped += worker_stats.skipped;
        stats.failed += worker_stats.failed;
    }

    if stats.failed > 0 {
        return Err(PushError::UploadsFailed {
            failed: stats.failed,
            total: required.len(),
        });
    }

    registry
        .push_package(
            &package,
            &hash,
            &PushRequest {
                dry_run: false,
                public: options.public,
                contents,
                description: &options.description,
            },
        )
        .await?;
    registry.put_tag(&package, LATEST_TAG, &hash).await?;

    if let Some(reporter) = &reporter {
        reporter.on_push_complete(&package, &hash);
    }
    tracing::info!(
        "pushed {package} at {hash:x} ({} uploaded, {} already present)",
        stats.uploaded,
        stats.skipped
    );

    Ok(PushResult {
        hash,
        uploaded: stats.uploaded,
        skipped: stats.skipped,
    })
}

/// State shared by the upload workers of one push. The queue and the progress
/// counter are the only parts that are mutated.
struct UploadContext<'a> {
    store: &'a PackageStore,
    registry: &'a RegistryClient,
    reupload: bool,
    upload_urls: &'a BTreeMap<Sha256Hash, UploadUrls>,
    sizes: &'a HashMap<Sha256Hash, u64>,
    queue: Mutex<Vec<Sha256Hash>>,
    progress: Arc<PushProgress>,
}

#[derive(Debug, Default)]
struct WorkerStats {
    uploaded: usize,
    skipped: usize,
    failed: usize,
}

enum Uploaded {
    Skipped,
    Transferred,
}

/// The number of uncompressed bytes accounted for so far.
struct PushProgress {
    uploaded: AtomicU64,
    total_bytes: u64,
    reporter: Option<Arc<dyn Reporter>>,
}

impl PushProgress {
    fn advance(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let uploaded = self.uploaded.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(reporter) = &self.reporter {
            reporter.on_upload_progress(uploaded, self.total_bytes);
        }
    }
}

/// Tracks how much of one object was added to the push progress. Reports
/// only ever grow, so a retried transfer does not count its bytes twice.
struct ObjectProgress {
    push: Arc<PushProgress>,
    size: u64,
    reported: AtomicU64,
}

impl ObjectProgress {
    fn report(&self, original_bytes: u64) {
        let value = original_bytes.min(self.size);
        let previous = self.reported.fetch_max(value, Ordering::SeqCst);
        if value > previous {
            self.push.advance(value - previous);
        }
    }

    fn complete(&self) {
        self.report(self.size);
    }
}

/// Scales a number of compressed bytes to the equivalent number of original
/// bytes.
fn scale_progress(sent: u64, original_size: u64, compressed_size: u64) -> u64 {
    if compressed_size == 0 {
        return original_size;
    }
    (u128::from(sent) * u128::from(original_size) / u128::from(compressed_size)) as u64
}

async fn upload_worker(context: &UploadContext<'_>) -> WorkerStats {
    let mut stats = WorkerStats::default();
    loop {
        let Some(hash) = context.queue.lock().pop() else {
            break;
        };
        match upload_object(context, &hash).await {
            Ok(Uploaded::Skipped) => {
                tracing::debug!("{hash:x} is already stored by the registry");
                stats.skipped += 1;
                if let Some(reporter) = &context.progress.reporter {
                    reporter.on_object_skipped(&hash);
                }
            }
            Ok(Uploaded::Transferred) => {
                tracing::debug!("uploaded {hash:x}");
                stats.uploaded += 1;
                if let Some(reporter) = &context.progress.reporter {
                    reporter.on_object_uploaded(&hash);
                }
            }
            Err(err) => {
                tracing::warn!("failed to upload {hash:x}: {err}");
                stats.failed += 1;
                if let Some(reporter) = &context.progress.reporter {
                    reporter.on_object_failed(&hash, &err);
                }
            }
        }
    }
    stats
}

async fn upload_object(
    context: &UploadContext<'_>,
    hash: &Sha256Hash,
) -> Result<Uploaded, UploadError> {
    let urls = context
        .upload_urls
        .get(hash)
        .ok_or(UploadError::MissingUrl(*hash))?;
    let progress = Arc::new(ObjectProgress {
        push: context.progress.clone(),
        size: context.sizes.get(hash).copied().unwrap_or_default(),
        reported: AtomicU64::new(0),
    });

    if !context.reupload && context.registry.object_exists(&urls.head).await? {
        progress.complete();
        return Ok(Uploaded::Skipped);
    }

    let object_path = context.store.objects().object_path(hash);
    let (compressed, compressed_size) =
        compress_object(&object_path, &context.store.objects().temp_dir()).await?;

    // The body is streamed from disk and cannot be replayed by the retry
    // middleware, so every attempt reopens the compressed file.
    let policy = context.registry.retry_policy();
    let request_start = SystemTime::now();
    let mut retries = 0;
    loop {
        let result = send_compressed(
            context.registry.transfer_client(),
            &urls.put,
            &compressed,
            compressed_size,
            progress.clone(),
        )
        .await;
        match result {
            Ok(()) => break,
            Err(err)
                if err.is_transient() && wait_for_retry(&policy, request_start, retries).await =>
            {
                retries += 1;
                tracing::debug!("retrying upload of {hash:x} (attempt {}): {err}", retries + 1);
            }
            Err(err) => return Err(err),
        }
    }

    progress.complete();
    Ok(Uploaded::Transferred)
}

/// Gzip compresses an object into a temporary file in `temp_dir`. The file
/// is deleted when the returned path is dropped.
async fn compress_object(
    object_path: &Path,
    temp_dir: &Path,
) -> std::io::Result<(tempfile::TempPath, u64)> {
    fs::create_dir_all(temp_dir).await?;
    let (file, temp_path) = tempfile::Builder::new()
        .suffix(".gz")
        .tempfile_in(temp_dir)?
        .into_parts();

    let source = fs::File::open(object_path).await?;
    let mut encoder = GzipEncoder::new(BufReader::new(source));
    let mut target = tokio::fs::File::from_std(file);
    let compressed_size = tokio::io::copy(&mut encoder, &mut target).await?;
    target.flush().await?;

    Ok((temp_path, compressed_size))
}

async fn send_compressed(
    client: &reqwest::Client,
    url: &Url,
    compressed: &Path,
    compressed_size: u64,
    progress: Arc<ObjectProgress>,
) -> Result<(), UploadError> {
    let file = fs::File::open(compressed).await?;

    let mut sent = 0;
    let reader_stream = ReaderStream::new(file).inspect_ok(move |bytes| {
        sent += bytes.len() as u64;
        progress.report(scale_progress(sent, progress.size, compressed_size));
    });

    let response = client
        .put(url.clone())
        .header(CONTENT_ENCODING, "gzip")
        .header(CONTENT_LENGTH, compressed_size)
        .body(reqwest::Body::wrap_stream(reader_stream))
        .send()
        .await
        .map_err(RegistryError::from)?;
    check_status(response).await?;
    Ok(())
}
