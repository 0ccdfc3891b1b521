//! A stream wrapper which buffers the initial read so that it can be peeked
//! into without consuming it from the actual read sequence.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

pin_project! {
    /// Byte stream with a one-shot look-ahead buffer.
    ///
    /// After [`PeekableStream::peek`] the buffered bytes are replayed by
    /// subsequent reads, in order, before the underlying stream is consulted
    /// again. Writes, flush and shutdown pass through untouched.
    pub struct PeekableStream<S> {
        #[pin]
        inner: S,
        buffer: Vec<u8>,
        peeked: bool,
    }
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            peeked: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Peek for at most `n` bytes. The returned slice is internal and must
    /// not be modified. May be called once, before any read; a second call
    /// is a programming error.
    ///
    /// An empty slice means the stream reached EOF before any data arrived.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        assert!(!self.peeked, "peeked more than once");
        self.peeked = true;
        let mut buffer = vec![0u8; n];
        let size = self.inner.read(&mut buffer).await?;
        buffer.truncate(size);
        self.buffer = buffer;
        Ok(&self.buffer)
    }
}

impl<S: AsyncRead> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (client, server) = tokio::io::duplex(64);
        let mut stream = PeekableStream::new(server);

        let mut client = client;
        client.write_all(b"hello world").await.unwrap();
        drop(client);

        let peeked = stream.peek(5).await.unwrap().to_vec();
        assert_eq!(peeked, b"hello");

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn buffered_bytes_are_replayed_across_short_reads() {
        let (client, server) = tokio::io::duplex(64);
        let mut stream = PeekableStream::new(server);

        let mut client = client;
        client.write_all(b"abcdefgh").await.unwrap();
        drop(client);

        assert_eq!(stream.peek(6).await.unwrap(), b"abcdef");

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"efgh");
    }

    #[tokio::test]
    async fn peek_on_closed_stream_returns_empty() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut stream = PeekableStream::new(server);
        assert!(stream.peek(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "peeked more than once")]
    async fn double_peek_panics() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client;
        client.write_all(b"x").await.unwrap();
        let mut stream = PeekableStream::new(server);
        let _ = stream.peek(1).await;
        let _ = stream.peek(1).await;
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = PeekableStream::new(server);
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
