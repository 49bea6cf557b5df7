//! Plain HTTP listener exposing the Prometheus registry.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::request::read_request;
use crate::error::{ProxyError, Result};
use crate::state::AppState;
use crate::transport::ConnBuffer;

pub const METRICS_PATH: &str = "/metrics";

pub struct MetricsServer {
    state: Arc<AppState>,
}

impl MetricsServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Binds the configured metrics address and serves it. Returns at once
    /// when no metrics port is configured.
    pub async fn run(self) -> Result<()> {
        let Some(addr) = self.state.config.read().await.metrics_addr() else {
            return Ok(());
        };
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let header_timeout = self.state.config.read().await.header_timeout();
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        info!("Metrics available at http://{}{}", listener.local_addr()?, METRICS_PATH);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept metrics connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = respond(&state, stream, header_timeout).await {
                    debug!(%peer, "Metrics request failed: {}", e);
                }
            });
        }

        Ok(())
    }
}

async fn respond(state: &AppState, stream: TcpStream, header_timeout: Duration) -> io::Result<()> {
    let mut conn = ConnBuffer::new(stream);
    let request = match tokio::time::timeout(header_timeout, read_request(&mut conn)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(io::ErrorKind::TimedOut.into()),
    };

    let (status, content_type, body) = if request.uri().path() == METRICS_PATH {
        let body = state.metrics.encode_text().map_err(io::Error::other)?;
        ("200 OK", prometheus::TEXT_FORMAT, body)
    } else {
        ("404 Not Found", "text/plain", "not found\n".to_string())
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.write_all(response.as_bytes()).await?;
    conn.shutdown().await
}
