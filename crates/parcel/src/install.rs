//! Installing a package instance from the registry.

use std::{path::Path, sync::Arc, time::SystemTime};

use async_compression::tokio::bufread::GzipDecoder;
use fs_err::tokio as fs;
use futures::StreamExt;
use http::{
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};
use parcel_digest::Sha256Hash;
use parcel_registry::{
    check_status, retry::wait_for_retry, RegistryClient, RegistryError, ResolveError,
};
use parcel_store::{ObjectStore, PackageStore, StoreError, Writer};
use parcel_tree::{find_object_hashes, hash_contents, PackageRef, PackageSpec};
use tokio::io::{AsyncWriteExt, BufReader};
use url::Url;

use crate::Reporter;

/// How often a download is attempted when the connection fails.
pub const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Options that control an install.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Replace a package that is already installed.
    pub force: bool,
}

/// The outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallResult {
    /// The package that was installed, without its subpath.
    pub package: PackageRef,

    /// The package hash the selector resolved to.
    pub hash: Sha256Hash,

    /// The number of objects that were downloaded.
    pub downloaded: usize,

    /// The number of objects that were already present locally.
    pub reused: usize,

    /// True if the package was already installed at `hash` and nothing was
    /// done.
    pub unchanged: bool,
}

/// An error that occurred while installing a package.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The selector could not be resolved to a package hash.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A registry call failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The local store could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another instance of the package is installed and `force` was not set.
    #[error("{package} is already installed at {installed:x}, use force to overwrite it")]
    AlreadyInstalled {
        /// The package.
        package: PackageRef,
        /// The hash of the installed tree.
        installed: Sha256Hash,
    },

    /// The tree sent by the registry does not hash to the requested hash.
    #[error("the tree of {package} hashes to {actual:x} instead of {expected:x}")]
    TreeHashMismatch {
        /// The package.
        package: PackageRef,
        /// The hash that was requested.
        expected: Sha256Hash,
        /// The hash of the received tree.
        actual: Sha256Hash,
    },

    /// The subpath does not exist in the tree.
    #[error("{0} does not exist")]
    SubpathNotFound(PackageRef),

    /// The registry did not provide a download url for an object.
    #[error("the registry did not provide a download url for {0:x}")]
    MissingDownloadUrl(Sha256Hash),

    /// An object could not be downloaded.
    #[error("failed to download {hash:x}")]
    Download {
        /// The digest of the object.
        hash: Sha256Hash,
        /// The underlying error.
        #[source]
        source: DownloadError,
    },
}

/// An error that occurred while downloading a single object.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The server resumed at a different offset than requested.
    #[error("expected the response to start at byte {expected_start}, got content range {}", .content_range.as_deref().unwrap_or("<none>"))]
    UnexpectedContentRange {
        /// The `Content-Range` header of the response, if any.
        content_range: Option<String>,
        /// The offset that was requested.
        expected_start: u64,
    },

    /// The downloaded content does not hash to the expected digest. The
    /// content was discarded.
    #[error("downloaded content hashes to {actual:x} instead of {expected:x}")]
    DigestMismatch {
        /// The digest of the object.
        expected: Sha256Hash,
        /// The digest of the downloaded content.
        actual: Sha256Hash,
    },

    /// The transfer failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An IO error occurred while staging the download.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The object could not be committed.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for DownloadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DigestMismatch { expected, actual } => {
                DownloadError::DigestMismatch { expected, actual }
            }
            StoreError::Io(err) => DownloadError::Io(err),
            err => DownloadError::Store(err),
        }
    }
}

impl DownloadError {
    fn is_connection_error(&self) -> bool {
        matches!(self, DownloadError::Registry(err) if err.is_connection_error())
    }
}

/// A parsed `Content-Range: bytes <start>-<end>/<total>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// The offset of the first byte in the body.
    pub start: u64,
    /// The offset of the last byte in the body.
    pub end: u64,
    /// The size of the complete resource, if known.
    pub total: Option<u64>,
}

/// Parses the value of a `Content-Range` header.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let range = value.trim().strip_prefix("bytes ")?;
    let (range, total) = range.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let range = ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total: match total.trim() {
            "*" => None,
            total => Some(total.parse().ok()?),
        },
    };
    (range.start <= range.end).then_some(range)
}

/// Installs the instance of a package selected by `spec`.
///
/// The tree is verified against the resolved package hash before anything is
/// downloaded, and every object is verified against its digest before it is
/// committed. The package record is written last. When `spec` names a
/// subpath only the objects below it are downloaded and the record holds the
/// pruned tree.
pub async fn install(
    store: &PackageStore,
    registry: &RegistryClient,
    spec: &PackageSpec,
    options: InstallOptions,
    reporter: Option<Arc<dyn Reporter>>,
) -> Result<InstallResult, InstallError> {
    let target = &spec.package;
    let package = target.package();
    let hash = registry
        .resolve_selector(target, &spec.selector_or_default())
        .await?;

    if let Some(existing) = store.get_package(&package)? {
        if target.subpath.is_empty() && existing.hash == hash && !options.force {
            tracing::info!("{package} is already installed at {hash:x}");
            return Ok(InstallResult {
                package,
                hash,
                downloaded: 0,
                reused: 0,
                unchanged: true,
            });
        }
        if !options.force {
            return Err(InstallError::AlreadyInstalled {
                package,
                installed: existing.hash,
            });
        }
    }

    let response = registry.get_package(target, &hash).await?;
    let actual = hash_contents(&response.contents);
    if actual != hash {
        return Err(InstallError::TreeHashMismatch {
            package,
            expected: hash,
            actual,
        });
    }

    let tree = response
        .contents
        .subtree(target.subpath.as_slice())
        .ok_or_else(|| InstallError::SubpathNotFound(target.clone()))?;
    let objects = find_object_hashes(&tree);

    if let Some(reporter) = &reporter {
        reporter.on_install_start(target, objects.len());
    }
    tracing::info!("installing {target} at {hash:x}: {} objects", objects.len());

    let mut downloaded = 0;
    let mut reused = 0;
    for object in &objects {
        if store.objects().has_object(object) {
            if store.objects().verify_object_async(object).await? {
                reused += 1;
                if let Some(reporter) = &reporter {
                    reporter.on_object_reused(object);
                }
                continue;
            }
            tracing::warn!("local copy of {object:x} is corrupted, downloading it again");
        }

        let url = response
            .urls
            .get(object)
            .ok_or(InstallError::MissingDownloadUrl(*object))?;
        download_object(registry, store.objects(), object, url, reporter.as_deref())
            .await
            .map_err(|source| InstallError::Download {
                hash: *object,
                source,
            })?;
        downloaded += 1;
    }

    let installed = store.install_tree_async(&package, &tree).await?;
    if let Some(reporter) = &reporter {
        reporter.on_install_complete(&package, &installed);
    }

    Ok(InstallResult {
        package,
        hash,
        downloaded,
        reused,
        unchanged: false,
    })
}

/// Downloads a gzip compressed object from `url` into `objects`.
///
/// The compressed bytes are staged in `tmp/<digest>.gz`. A staging file left
/// behind by an interrupted download is resumed with a range request instead
/// of starting over. Once the download completed the content is decompressed,
/// verified against `hash` and committed; the staging file is removed either
/// way.
pub async fn download_object(
    registry: &RegistryClient,
    objects: &ObjectStore,
    hash: &Sha256Hash,
    url: &Url,
    reporter: Option<&dyn Reporter>,
) -> Result<(), DownloadError> {
    let staging = objects.staging_path(&format!("{hash:x}.gz"))?;
    let index = reporter.map(|reporter| reporter.on_download_start(hash));
    let progress = |downloaded: u64, total: Option<u64>| {
        if let (Some(reporter), Some(index)) = (reporter, index) {
            reporter.on_download_progress(index, downloaded, total);
        }
    };

    fetch_resumable(registry, url, &staging, progress).await?;

    let result = decompress_and_commit(objects, &staging, hash).await;
    match fs::remove_file(&staging).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            tracing::warn!("failed to remove {}: {err}", staging.display());
        }
        _ => {}
    }
    result?;

    if let (Some(reporter), Some(index)) = (reporter, index) {
        reporter.on_download_complete(index);
    }
    tracing::debug!("downloaded {hash:x}");
    Ok(())
}

/// Appends the remainder of the resource at `url` to the file at `staging`,
/// retrying on connection failures.
async fn fetch_resumable(
    registry: &RegistryClient,
    url: &Url,
    staging: &Path,
    progress: impl Fn(u64, Option<u64>),
) -> Result<(), DownloadError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(staging)
        .await?;

    let policy = registry.retry_policy();
    let request_start = SystemTime::now();
    let mut retries = 0;
    loop {
        match fetch_range(registry.transfer_client(), url, &mut file, &progress).await {
            Ok(()) => return Ok(()),
            Err(err)
                if err.is_connection_error()
                    && retries + 1 < DOWNLOAD_ATTEMPTS
                    && wait_for_retry(&policy, request_start, retries).await =>
            {
                retries += 1;
                tracing::debug!("resuming download of {url} (attempt {}): {err}", retries + 1);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Requests everything after the bytes already in `file` and appends it.
async fn fetch_range(
    client: &reqwest::Client,
    url: &Url,
    file: &mut fs::File,
    progress: &impl Fn(u64, Option<u64>),
) -> Result<(), DownloadError> {
    file.flush().await?;
    let offset = file.metadata().await?.len();

    let response = client
        .get(url.clone())
        .header(RANGE, format!("bytes={offset}-"))
        .send()
        .await
        .map_err(RegistryError::from)?;

    // Everything was staged by an earlier attempt.
    if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        tracing::debug!("{url} is already fully staged ({offset} bytes)");
        return Ok(());
    }
    let response = check_status(response).await?;

    let content_range = response
        .headers()
        .get(CONTENT_RANGE)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
    let total = match content_range.as_deref() {
        Some(value) => match parse_content_range(value) {
            Some(range) if range.start == offset => range.total,
            _ => {
                return Err(DownloadError::UnexpectedContentRange {
                    content_range,
                    expected_start: offset,
                })
            }
        },
        // Without a content range the body is the whole resource.
        None if offset == 0 => response.content_length(),
        None => {
            return Err(DownloadError::UnexpectedContentRange {
                content_range,
                expected_start: offset,
            })
        }
    };

    let mut downloaded = offset;
    progress(downloaded, total);
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(RegistryError::from)?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        progress(downloaded, total);
    }
    file.flush().await?;
    Ok(())
}

async fn decompress_and_commit(
    objects: &ObjectStore,
    staging: &Path,
    hash: &Sha256Hash,
) -> Result<(), DownloadError> {
    let compressed = fs::File::open(staging).await?;
    let mut decoder = GzipDecoder::new(BufReader::new(compressed));
    let mut writer = Writer::create(objects).await?;
    tokio::io::copy(&mut decoder, &mut writer).await?;
    writer.commit(hash).await?;
    Ok(())
}
