use super::{HashingWriter, Sha256Hash};
use std::{
    io::Error,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::AsyncWrite;

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.writer).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.tally.feed(&buf[..written]);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// Hashes the file at `path` without blocking the executor.
pub async fn compute_file_digest_async(path: impl AsRef<Path>) -> Result<Sha256Hash, Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut sink = HashingWriter::new(tokio::io::sink());
    tokio::io::copy(&mut file, &mut sink).await?;
    Ok(sink.into_parts().1)
}
