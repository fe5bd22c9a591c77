#![deny(missing_docs)]

//! Local storage for parcel packages.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   objects/<sha256 hex>        committed objects, keyed by the digest of their bytes
//!   tmp/                        staging area for in-progress writes and partial downloads
//!   pkgs/<owner>/<name>.json    the installed contents tree of a package and its hash
//! ```
//!
//! # Components
//!
//! - [`ObjectStore`]: the content addressable object store.
//! - [`SyncWriter`] / [`Writer`]: stream content into the store; the object becomes visible
//!   only once it is committed.
//! - [`PackageStore`]: records which tree is installed for a package, on top of an
//!   [`ObjectStore`].
//!
//! Objects are always written to a temporary file in `tmp/` first and renamed
//! into `objects/` only after their digest has been computed (and, when an
//! expected digest is known, verified). A reader therefore never observes a
//! partially written object, and a crash leaves at most stray files in `tmp/`.
//!
//! # Deduplication
//!
//! Objects are keyed by content. Writing the same bytes twice, from the same
//! or from different packages, stores them once.

mod package_store;
mod sync_writer;
mod writer;

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use parcel_digest::{compute_bytes_digest, Sha256Hash};
pub use package_store::{InstalledPackage, PackageStore};
pub use sync_writer::SyncWriter;
pub use writer::Writer;

/// The name of the directory holding committed objects.
pub const OBJECTS_DIR: &str = "objects";

/// The name of the staging directory.
pub const TEMP_DIR: &str = "tmp";

/// The name of the directory holding package records.
pub const PACKAGES_DIR: &str = "pkgs";

/// An error returned by the object or package store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The bytes that were written do not hash to the expected digest. Nothing
    /// was committed.
    #[error("object content does not match its digest: expected {expected:x}, got {actual:x}")]
    DigestMismatch {
        /// The digest the caller expected.
        expected: Sha256Hash,
        /// The digest of the bytes that were actually written.
        actual: Sha256Hash,
    },

    /// A tree references an object that is not present in the store.
    #[error("object {0:x} is not present in the store")]
    MissingObject(Sha256Hash),

    /// A package record could not be parsed.
    #[error("failed to parse the package record at {0}")]
    InvalidRecord(PathBuf, #[source] serde_json::Error),

    /// An IO error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Determines the default store directory.
///
/// It first checks the environment variable `PARCEL_STORE_DIR`. If that is not
/// set it falls back to `dirs::data_dir()/parcel`.
pub fn default_store_dir() -> anyhow::Result<PathBuf> {
    std::env::var("PARCEL_STORE_DIR")
        .map(PathBuf::from)
        .or_else(|_| {
            dirs::data_dir()
                .ok_or_else(|| {
                    anyhow::anyhow!("could not determine data directory for current platform")
                })
                .map(|p| p.join("parcel"))
        })
}

/// A content addressable store of immutable objects.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Constructs a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory used for temporary files.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    /// Returns the path at which the object with the given digest is stored
    /// once committed. The path might not exist.
    pub fn object_path(&self, hash: &Sha256Hash) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(format!("{hash:x}"))
    }

    /// Returns true if an object with the given digest has been committed.
    pub fn has_object(&self, hash: &Sha256Hash) -> bool {
        self.object_path(hash).is_file()
    }

    /// Returns the size in bytes of a committed object.
    pub fn object_size(&self, hash: &Sha256Hash) -> Result<u64, StoreError> {
        match fs_err::metadata(self.object_path(hash)) {
            Ok(metadata) => Ok(metadata.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::MissingObject(*hash))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Re-hashes a committed object and returns whether its content still
    /// matches its name. Returns `false` if the object does not exist.
    pub fn verify_object(&self, hash: &Sha256Hash) -> Result<bool, StoreError> {
        match parcel_digest::compute_file_digest(self.object_path(hash)) {
            Ok(actual) => Ok(actual == *hash),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Like [`ObjectStore::object_size`] but runs on the blocking thread pool.
    pub async fn object_size_async(&self, hash: &Sha256Hash) -> Result<u64, StoreError> {
        let (store, hash) = (self.clone(), *hash);
        run_blocking(move || store.object_size(&hash)).await
    }

    /// Like [`ObjectStore::verify_object`] but hashes the object on the
    /// blocking thread pool.
    pub async fn verify_object_async(&self, hash: &Sha256Hash) -> Result<bool, StoreError> {
        let (store, hash) = (self.clone(), *hash);
        run_blocking(move || store.verify_object(&hash)).await
    }

    /// Returns a stable path inside the staging area, creating the staging
    /// directory if needed. Unlike the anonymous files used by the writers the
    /// path survives process restarts, which makes it usable for resumable
    /// downloads.
    pub fn staging_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        let temp_dir = self.temp_dir();
        fs_err::create_dir_all(&temp_dir)?;
        Ok(temp_dir.join(name))
    }

    /// Stages an object in a temporary file, lets `write` fill it and commits
    /// it under `expected` if the written bytes hash to that digest.
    ///
    /// If `write` fails or the digest does not match, the temporary file is
    /// removed and nothing becomes visible at [`Self::object_path`].
    pub fn stage_and_commit<F>(&self, expected: &Sha256Hash, write: F) -> Result<PathBuf, StoreError>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        let mut writer = SyncWriter::create(self)?;
        write(&mut writer)?;
        writer.commit(expected)?;
        Ok(self.object_path(expected))
    }

    /// Writes a byte buffer to the store, returning its digest.
    ///
    /// The digest is computed from the buffer first so that content that is
    /// already stored causes no disk IO at all.
    pub fn write_bytes(&self, content: &[u8]) -> Result<Sha256Hash, StoreError> {
        let hash = compute_bytes_digest(content);
        if self.has_object(&hash) {
            return Ok(hash);
        }
        self.stage_and_commit(&hash, |w| w.write_all(content))?;
        Ok(hash)
    }

    /// Writes everything read from `reader` to the store and returns the digest.
    pub fn write_reader(&self, reader: &mut impl Read) -> Result<Sha256Hash, StoreError> {
        let mut writer = SyncWriter::create(self)?;
        std::io::copy(reader, &mut writer)?;
        writer.finish()
    }

    /// Copies the file at `path` into the store and returns its digest.
    pub fn import_file(&self, path: &Path) -> Result<Sha256Hash, StoreError> {
        let mut file = fs_err::File::open(path)?;
        self.write_reader(&mut file)
    }

    /// Moves a fully written temporary file to its final location.
    ///
    /// When the content was verified against an expected digest an existing
    /// object is replaced, which repairs a corrupted copy. Otherwise an
    /// existing object is kept.
    fn persist(
        &self,
        temp_path: tempfile::TempPath,
        hash: &Sha256Hash,
        replace: bool,
    ) -> std::io::Result<()> {
        let path = self.object_path(hash);
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let result = if replace {
            temp_path.persist(&path).map_err(std::io::Error::from)
        } else {
            temp_path.persist_noclobber(&path).map_err(std::io::Error::from)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Runs blocking filesystem work off the async executor. Panics are
/// propagated to the caller.
pub(crate) async fn run_blocking<T, E>(
    work: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> Result<T, StoreError>
where
    T: Send + 'static,
    E: Into<StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work)
        .await
        .map_err(tokio::task::JoinError::try_into_panic)
    {
        Ok(result) => result.map_err(Into::into),
        Err(Err(e)) => Err(std::io::Error::new(std::io::ErrorKind::Interrupted, e).into()),
        Err(Ok(panic)) => std::panic::resume_unwind(panic),
    }
}
