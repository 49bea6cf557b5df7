use async_trait::async_trait;
use http::StatusCode;
use std::io;
use tokio::io::AsyncWriteExt;

use crate::error::TunnelError;
use crate::proxy::ResponseWriter;
use crate::transport::{AsyncStream, ConnBuffer};

/// Response side of a raw HTTP/1.x connection; supports hijacking.
pub struct ConnWriter<S> {
    conn: Option<ConnBuffer<S>>,
}

impl<S> ConnWriter<S> {
    pub fn new(conn: ConnBuffer<S>) -> Self {
        Self { conn: Some(conn) }
    }

    pub fn is_hijacked(&self) -> bool {
        self.conn.is_none()
    }
}

#[async_trait]
impl<S: AsyncStream> ResponseWriter for ConnWriter<S> {
    type Conn = ConnBuffer<S>;

    fn hijack(&mut self) -> Result<Self::Conn, TunnelError> {
        self.conn.take().ok_or(TunnelError::HijackUnsupported)
    }

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection hijacked"))?;
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        conn.write_all(head.as_bytes()).await
    }
}
