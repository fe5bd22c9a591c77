//! Synchronous writer for the object store.

use std::io::Write;

use parcel_digest::{HashingWriter, Sha256Hash};

use crate::{ObjectStore, StoreError};

/// A synchronous writer that streams content into an [`ObjectStore`].
///
/// Content is written to a temporary file in the staging directory. It only
/// becomes an object when [`SyncWriter::finish`] or [`SyncWriter::commit`] is
/// called; dropping the writer deletes the temporary file.
pub struct SyncWriter {
    store: ObjectStore,
    temp_path: tempfile::TempPath,
    writer: HashingWriter<std::fs::File>,
}

impl SyncWriter {
    /// Opens a new temporary file in the staging directory of `store`.
    pub fn create(store: &ObjectStore) -> std::io::Result<Self> {
        let temp_dir = store.temp_dir();
        fs_err::create_dir_all(&temp_dir)?;

        let temp_file = tempfile::Builder::new().tempfile_in(&temp_dir)?;
        let (file, temp_path) = temp_file.into_parts();
        Ok(SyncWriter {
            store: store.clone(),
            temp_path,
            writer: HashingWriter::new(file),
        })
    }

    /// Returns the number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Stores the content under the digest of the bytes that were written.
    pub fn finish(mut self) -> Result<Sha256Hash, StoreError> {
        self.writer.flush()?;
        let (file, hash) = self.writer.into_parts();
        drop(file);
        self.store.persist(self.temp_path, &hash, false)?;
        Ok(hash)
    }

    /// Stores the content under `expected` if the bytes that were written hash
    /// to it. Otherwise the temporary file is removed and
    /// [`StoreError::DigestMismatch`] is returned.
    pub fn commit(mut self, expected: &Sha256Hash) -> Result<(), StoreError> {
        self.writer.flush()?;
        let (file, actual) = self.writer.into_parts();
        drop(file);
        if actual != *expected {
            tracing::debug!("discarding staged object, expected {expected:x} but got {actual:x}");
            return Err(StoreError::DigestMismatch {
                expected: *expected,
                actual,
            });
        }
        self.store.persist(self.temp_path, expected, true)?;
        Ok(())
    }
}

impl Write for SyncWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
