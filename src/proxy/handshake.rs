//! Inner CONNECT handshake with replay of over-read bytes.
//!
//! Validating the upstream's response head goes through a buffered reader,
//! which may pull bytes past the end of the head off the raw connection.
//! Those bytes belong to the tunnel. Every byte read during validation is
//! therefore teed into a side buffer; once the status checks out, the side
//! buffer is re-parsed with a fresh parser to find where the head ends, and
//! everything after that point is replayed ahead of live reads.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tracing::debug;

use crate::error::HandshakeError;

/// Largest response head accepted from an upstream relay.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Capacity of the reader used for status validation.
pub const PARSE_BUFFER_SIZE: usize = 4096;

const MAX_HEADERS: usize = 64;

/// Connection whose first reads are served from bytes recovered during the
/// handshake.
#[derive(Debug)]
pub struct ReplayStream<S> {
    inner: S,
    replay: Bytes,
}

impl<S> ReplayStream<S> {
    pub fn new(inner: S, replay: Bytes) -> Self {
        Self { inner, replay }
    }

    /// Recovered bytes not yet read.
    pub fn pending(&self) -> &[u8] {
        &self.replay
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.replay.is_empty() {
            let len = buf.remaining().min(this.replay.len());
            buf.put_slice(&this.replay[..len]);
            this.replay.advance(len);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Reader that copies everything it yields into `captured`.
struct TeeReader<'a, R> {
    inner: &'a mut R,
    captured: &'a mut BytesMut,
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.captured.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

/// Sends `CONNECT target` over `conn` and waits for a 200 response.
///
/// On success the returned stream yields, in order, any bytes the upstream
/// sent after its response head, then live data.
pub async fn connect<S>(mut conn: S, target: &str) -> Result<ReplayStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    let mut captured = BytesMut::with_capacity(PARSE_BUFFER_SIZE);
    let status = read_status(&mut conn, &mut captured).await?;
    if status != 200 {
        return Err(HandshakeError::Status(status));
    }

    let head_len = head_len(&captured)?;
    let replay = captured.split_off(head_len).freeze();
    debug!(target, replayed = replay.len(), "Inner CONNECT established");

    Ok(ReplayStream::new(conn, replay))
}

/// First parse: reads the response head through a buffered reader and
/// returns its status code. Every byte pulled off `conn` lands in `captured`.
async fn read_status<S>(conn: &mut S, captured: &mut BytesMut) -> Result<u16, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let tee = TeeReader {
        inner: conn,
        captured,
    };
    let mut reader = BufReader::with_capacity(PARSE_BUFFER_SIZE, tee);
    let mut head = Vec::with_capacity(256);

    loop {
        // Caps a single line too, not just the sum of complete lines.
        let remaining = (MAX_HEAD_LEN + 1 - head.len()) as u64;
        let n = (&mut reader)
            .take(remaining)
            .read_until(b'\n', &mut head)
            .await?;
        if head.len() > MAX_HEAD_LEN {
            return Err(HandshakeError::TooLarge(MAX_HEAD_LEN));
        }
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") || head == b"\r\n" {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head)? {
        httparse::Status::Complete(_) => Ok(response.code.unwrap_or(0)),
        httparse::Status::Partial => Err(HandshakeError::Malformed(httparse::Error::Status)),
    }
}

/// Second parse: locates the end of the head inside the captured bytes.
fn head_len(captured: &[u8]) -> Result<usize, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(captured)? {
        httparse::Status::Complete(len) => Ok(len),
        httparse::Status::Partial => Err(HandshakeError::Closed),
    }
}
