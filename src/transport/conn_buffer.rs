//! Buffered wrapper around a hijacked connection.
//!
//! The hosting server reads ahead while parsing a request head, so by the time
//! a handler takes the raw stream there may already be client bytes sitting in
//! the server's read buffer. `ConnBuffer` keeps those bytes in front of the
//! stream so nothing is lost when ownership moves between layers.

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Buffers handed over together with the raw stream by [`ConnBuffer::into_parts`].
#[derive(Debug, Default)]
pub struct HandoffBuffers {
    /// Bytes read from the stream but not yet consumed.
    pub read: BytesMut,
    /// Bytes accepted for writing but not yet written to the stream.
    ///
    /// Filled only by hosts that queue response bytes before a takeover and
    /// pass them in through [`ConnBuffer::with_buffers`]. [`ConnWriter`]
    /// writes through, so connections from this crate's server hand over an
    /// empty write buffer.
    ///
    /// [`ConnWriter`]: crate::server::ConnWriter
    pub write: BytesMut,
}

#[derive(Debug)]
pub struct ConnBuffer<S> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    // Length acknowledged by the last poll_write, held until its flush completes.
    pending_ack: Option<usize>,
}

impl<S> ConnBuffer<S> {
    pub fn new(io: S) -> Self {
        Self::with_buffers(io, HandoffBuffers::default())
    }

    pub fn with_buffers(io: S, buffers: HandoffBuffers) -> Self {
        Self {
            io,
            read_buf: buffers.read,
            write_buf: buffers.write,
            pending_ack: None,
        }
    }

    /// Bytes already read ahead from the stream.
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    /// Drops `n` bytes from the front of the read-ahead buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        self.read_buf.advance(n.min(self.read_buf.len()));
    }

    /// Gives up the wrapper, returning the raw stream and any buffered bytes.
    pub fn into_parts(self) -> (S, HandoffBuffers) {
        (
            self.io,
            HandoffBuffers {
                read: self.read_buf,
                write: self.write_buf,
            },
        )
    }
}

impl<S: AsyncRead + Unpin> ConnBuffer<S> {
    /// Returns up to `n` bytes without consuming them.
    ///
    /// Fewer than `n` bytes are returned only if the stream reaches EOF first.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.read_buf.len() < n {
            self.read_buf.reserve(n - self.read_buf.len());
            if self.io.read_buf(&mut self.read_buf).await? == 0 {
                break;
            }
        }
        let len = n.min(self.read_buf.len());
        Ok(&self.read_buf[..len])
    }

    /// Reads more bytes from the stream into the read-ahead buffer.
    ///
    /// Returns the number of new bytes, zero at EOF.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(4096);
        self.io.read_buf(&mut self.read_buf).await
    }
}

impl<S: AsyncWrite + Unpin> ConnBuffer<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ConnBuffer<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.read_buf.is_empty() {
            let len = buf.remaining().min(this.read_buf.len());
            buf.put_slice(&this.read_buf[..len]);
            this.read_buf.advance(len);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ConnBuffer<S> {
    /// Writes `buf` and flushes before reporting completion.
    ///
    /// If the flush is pending, the next call resumes the flush and reports the
    /// length accepted earlier instead of writing again.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending_ack.is_none() {
            ready!(this.poll_drain(cx))?;
            let n = ready!(Pin::new(&mut this.io).poll_write(cx, buf))?;
            this.pending_ack = Some(n);
        }
        match ready!(Pin::new(&mut this.io).poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(this.pending_ack.take().unwrap_or(0))),
            Err(e) => {
                this.pending_ack = None;
                Poll::Ready(Err(e))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Writer that records bytes and counts flushes.
    #[derive(Default, Clone)]
    struct RecordingWriter {
        written: Arc<std::sync::Mutex<Vec<u8>>>,
        flushes: Arc<AtomicUsize>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_serves_handed_over_bytes_first() {
        let io = tokio_test::io::Builder::new().read(b" world").build();
        let buffers = HandoffBuffers {
            read: BytesMut::from(&b"hello"[..]),
            write: BytesMut::new(),
        };
        let mut conn = ConnBuffer::with_buffers(io, buffers);

        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let io = tokio_test::io::Builder::new()
            .read(b"CON")
            .read(b"NECT rest")
            .build();
        let mut conn = ConnBuffer::new(io);

        assert_eq!(conn.peek(7).await.unwrap(), b"CONNECT");
        assert_eq!(conn.peek(3).await.unwrap(), b"CON");

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"CONNECT rest");
    }

    #[tokio::test]
    async fn test_peek_short_at_eof() {
        let io = tokio_test::io::Builder::new().read(b"abc").build();
        let mut conn = ConnBuffer::new(io);
        assert_eq!(conn.peek(10).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let io = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut conn = ConnBuffer::new(io);
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_every_write_is_flushed() {
        let writer = RecordingWriter::default();
        let mut conn = ConnBuffer::new(writer.clone());

        conn.write_all(b"first").await.unwrap();
        assert_eq!(writer.flushes.load(Ordering::SeqCst), 1);

        conn.write_all(b"second").await.unwrap();
        assert_eq!(writer.flushes.load(Ordering::SeqCst), 2);
        assert_eq!(writer.written.lock().unwrap().as_slice(), b"firstsecond");
    }

    #[tokio::test]
    async fn test_pending_write_bytes_go_out_first() {
        let writer = RecordingWriter::default();
        let buffers = HandoffBuffers {
            read: BytesMut::new(),
            write: BytesMut::from(&b"queued-"[..]),
        };
        let mut conn = ConnBuffer::with_buffers(writer.clone(), buffers);

        conn.write_all(b"fresh").await.unwrap();
        assert_eq!(writer.written.lock().unwrap().as_slice(), b"queued-fresh");
    }

    #[tokio::test]
    async fn test_into_parts_returns_buffers() {
        let io = tokio_test::io::Builder::new().read(b"abcdef").build();
        let mut conn = ConnBuffer::new(io);
        assert_eq!(conn.peek(6).await.unwrap(), b"abcdef");

        let (_io, buffers) = conn.into_parts();
        assert_eq!(&buffers.read[..], b"abcdef");
        assert!(buffers.write.is_empty());
    }
}
