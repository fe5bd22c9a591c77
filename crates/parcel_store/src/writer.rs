//! Async writer for the object store.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use fs_err::tokio as fs;
use parcel_digest::{HashingWriter, Sha256Hash};
use pin_project_lite::pin_project;
use tokio::io::AsyncWriteExt;

use crate::{run_blocking, ObjectStore, StoreError};

pin_project! {
    /// An async writer that streams content into an [`ObjectStore`].
    ///
    /// Content is written to a temporary file in the staging directory and is
    /// only moved into place by [`Writer::finish`] or [`Writer::commit`].
    /// Dropping the writer deletes the temporary file.
    pub struct Writer {
        store: ObjectStore,
        temp_path: tempfile::TempPath,
        #[pin]
        writer: HashingWriter<tokio::fs::File>,
    }
}

impl Writer {
    /// Opens a new temporary file in the staging directory of `store`.
    pub async fn create(store: &ObjectStore) -> std::io::Result<Self> {
        let temp_dir = store.temp_dir();
        fs::create_dir_all(&temp_dir).await?;

        let temp_file = tempfile::Builder::new().tempfile_in(&temp_dir)?;
        let (file, temp_path) = temp_file.into_parts();

        Ok(Writer {
            store: store.clone(),
            temp_path,
            writer: HashingWriter::new(tokio::fs::File::from_std(file)),
        })
    }

    /// Returns the number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Stores the content under the digest of the bytes that were written.
    pub async fn finish(self) -> Result<Sha256Hash, StoreError> {
        let (store, temp_path, hash) = self.finalize().await?;
        persist_blocking(store, temp_path, hash, false).await?;
        Ok(hash)
    }

    /// Stores the content under `expected` if the bytes that were written hash
    /// to it. Otherwise the temporary file is removed and
    /// [`StoreError::DigestMismatch`] is returned.
    pub async fn commit(self, expected: &Sha256Hash) -> Result<(), StoreError> {
        let (store, temp_path, actual) = self.finalize().await?;
        if actual != *expected {
            tracing::debug!("discarding staged object, expected {expected:x} but got {actual:x}");
            return Err(StoreError::DigestMismatch {
                expected: *expected,
                actual,
            });
        }
        persist_blocking(store, temp_path, actual, true).await
    }

    async fn finalize(
        mut self,
    ) -> Result<(ObjectStore, tempfile::TempPath, Sha256Hash), StoreError> {
        self.writer.flush().await?;
        let (file, hash) = self.writer.into_parts();
        file.sync_all().await?;
        drop(file);
        Ok((self.store, self.temp_path, hash))
    }
}

async fn persist_blocking(
    store: ObjectStore,
    temp_path: tempfile::TempPath,
    hash: Sha256Hash,
    replace: bool,
) -> Result<(), StoreError> {
    run_blocking(move || store.persist(temp_path, &hash, replace)).await
}

impl tokio::io::AsyncWrite for Writer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().writer.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}
