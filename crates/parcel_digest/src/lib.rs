#![deny(missing_docs)]

//! SHA-256 digests for parcel.
//!
//! Every object in a parcel store is named by the SHA-256 digest of its raw
//! bytes, and every package is named by the digest of its content tree. This
//! crate wraps the [RustCrypto/hashes](https://github.com/RustCrypto/hashes)
//! implementation so that hashes can be computed from files, in-memory
//! buffers, or while data is streamed through a reader or writer.
//!
//! ```no_run
//! use parcel_digest::{compute_bytes_digest, compute_file_digest, to_hex};
//!
//! let hash = compute_bytes_digest("Hello, world!");
//! println!("digest: {}", to_hex(&hash));
//!
//! let hash = compute_file_digest("somefile.csv").unwrap();
//! println!("digest: {hash:x}");
//! ```

#[cfg(feature = "tokio")]
mod tokio;

#[cfg(feature = "serde")]
pub mod serde;

pub use digest;
pub use sha2::Sha256;

#[cfg(feature = "tokio")]
pub use self::tokio::compute_file_digest_async;

use digest::{Digest, Output};
use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

/// The output of a SHA-256 hash. This is the identity of an object or package.
pub type Sha256Hash = Output<Sha256>;

/// The number of hex characters in the textual representation of a [`Sha256Hash`].
pub const SHA256_HEX_LEN: usize = 64;

/// Hashes the file at `path` by streaming it through the hasher.
pub fn compute_file_digest(path: impl AsRef<Path>) -> io::Result<Sha256Hash> {
    compute_reader_digest(&mut File::open(path)?)
}

/// Hashes everything that can be read from `reader`.
pub fn compute_reader_digest(reader: &mut impl Read) -> io::Result<Sha256Hash> {
    let mut sink = HashingWriter::new(io::sink());
    io::copy(reader, &mut sink)?;
    Ok(sink.into_parts().1)
}

/// Hashes an in-memory buffer.
pub fn compute_bytes_digest(bytes: impl AsRef<[u8]>) -> Sha256Hash {
    Sha256::digest(bytes)
}

/// Parses the hex form of a digest. Anything other than exactly
/// [`SHA256_HEX_LEN`] hex characters yields `None`.
pub fn parse_digest_from_hex(text: &str) -> Option<Sha256Hash> {
    let mut hash = Sha256Hash::default();
    hex::decode_to_slice(text, &mut hash).ok().map(|_| hash)
}

/// Returns the lowercase hex representation of a digest.
pub fn to_hex(hash: &Sha256Hash) -> String {
    hex::encode(hash)
}

/// Running hash plus the number of bytes fed into it.
#[derive(Default)]
struct Tally {
    hasher: Sha256,
    bytes: u64,
}

impl Tally {
    fn feed(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }
}

/// Forwards writes to an inner writer while hashing them.
///
/// [`HashingWriter::into_parts`] hands back the inner writer together with the
/// digest of everything that was accepted by it. Bytes the inner writer did
/// not accept are not hashed. With the `tokio` feature this type also
/// implements [`::tokio::io::AsyncWrite`].
pub struct HashingWriter<W> {
    writer: W,
    tally: Tally,
}

impl<W> HashingWriter<W> {
    /// Wraps `writer` with an empty hash.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            tally: Tally::default(),
        }
    }

    /// Bytes that passed through so far.
    pub fn bytes_written(&self) -> u64 {
        self.tally.bytes
    }

    /// Returns a reference to the wrapped writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Returns the wrapped writer and the digest of the bytes it accepted.
    pub fn into_parts(self) -> (W, Sha256Hash) {
        (self.writer, self.tally.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.tally.feed(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Hashes the bytes read through it. The counterpart of [`HashingWriter`].
pub struct HashingReader<R> {
    reader: R,
    tally: Tally,
}

impl<R> HashingReader<R> {
    /// Wraps `reader` with an empty hash.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            tally: Tally::default(),
        }
    }

    /// Bytes that were read so far.
    pub fn bytes_read(&self) -> u64 {
        self.tally.bytes
    }

    /// Returns the wrapped reader and the digest of the bytes read from it.
    pub fn into_parts(self) -> (R, Sha256Hash) {
        (self.reader, self.tally.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.reader.read(buf)?;
        self.tally.feed(&buf[..read]);
        Ok(read)
    }
}
