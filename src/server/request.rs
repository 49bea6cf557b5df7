use http::{Method, Request, Version};
use std::io;
use tokio::io::AsyncRead;

use crate::transport::ConnBuffer;

/// Largest request head accepted from a client.
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Reads one request head from `conn`.
///
/// Bytes after the head stay buffered in `conn`, so whoever takes the
/// connection over sees them first. Returns `Ok(None)` on a clean EOF before
/// any byte arrived.
pub async fn read_request<S>(conn: &mut ConnBuffer<S>) -> io::Result<Option<Request<()>>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((request, len)) = parse_head(conn.buffered())? {
            conn.consume(len);
            return Ok(Some(request));
        }
        if conn.buffered().len() >= MAX_REQUEST_HEAD {
            return Err(invalid_data("request head too large"));
        }
        if conn.fill().await? == 0 {
            if conn.buffered().is_empty() {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}

fn parse_head(buf: &[u8]) -> io::Result<Option<(Request<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let len = match parsed.parse(buf).map_err(invalid_data)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
        .map_err(invalid_data)?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(parsed.path.unwrap_or_default())
        .version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let request = builder.body(()).map_err(invalid_data)?;

    Ok(Some((request, len)))
}

fn invalid_data<E>(error: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, error)
}
