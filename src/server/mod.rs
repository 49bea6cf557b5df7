//! Hosting server: accepts client connections, reads one request head from
//! each and hands it to the [`TunnelProxy`] together with a hijackable writer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::proxy::TunnelProxy;
use crate::state::AppState;
use crate::transport::{AsyncStream, ConnBuffer};

pub mod metrics;
pub mod request;
pub mod writer;

pub use metrics::MetricsServer;
pub use request::read_request;
pub use writer::ConnWriter;

pub struct ProxyServer {
    state: Arc<AppState>,
    proxy: Arc<TunnelProxy>,
}

impl ProxyServer {
    pub fn new(state: Arc<AppState>, proxy: Arc<TunnelProxy>) -> Self {
        Self { state, proxy }
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.read().await.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown is signalled.
    ///
    /// Tunnels already established keep running after the listener closes.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let (max_connections, header_timeout) = {
            let config = self.state.config.read().await;
            (config.proxy.max_connections, config.header_timeout())
        };
        let limit = Arc::new(Semaphore::new(max_connections));
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();

        info!(
            role = ?self.proxy.role(),
            "Proxy server listening on {}", local_addr
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let Ok(permit) = limit.clone().try_acquire_owned() else {
                warn!(%peer, "Connection limit reached, dropping connection");
                self.state.metrics.record_refused_connection();
                continue;
            };

            let proxy = self.proxy.clone();
            let metrics = self.state.metrics.clone();
            tokio::spawn(async move {
                metrics.increment_active_connections();
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
                }
                handle_connection(&proxy, stream, peer, header_timeout).await;
                metrics.decrement_active_connections();
                drop(permit);
            });
        }

        info!("Proxy server stopped");
        Ok(())
    }
}

/// Reads one request head, giving up after `header_timeout`, and hands the
/// connection to the proxy.
async fn handle_connection<S: AsyncStream>(
    proxy: &TunnelProxy,
    stream: S,
    peer: SocketAddr,
    header_timeout: Duration,
) {
    let mut conn = ConnBuffer::new(stream);
    let request = match tokio::time::timeout(header_timeout, read_request(&mut conn)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!(%peer, "Dropping connection: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, "Request head not received within {:?}", header_timeout);
            return;
        }
    };

    debug!(%peer, method = %request.method(), uri = %request.uri(), "Request received");
    proxy.serve(request, ConnWriter::new(conn)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::tunnel::INVALID_ADDR;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start() -> (Arc<AppState>, SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        start_with(Config::default()).await
    }

    async fn start_with(
        mut config: Config,
    ) -> (Arc<AppState>, SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        config.proxy.max_connections = 1;
        let (state, _rx) = AppState::new(config);
        let proxy = Arc::new(TunnelProxy::new(state.proxy_options(None).await).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(ProxyServer::new(state.clone(), proxy).serve(listener));
        (state, addr, server)
    }

    #[tokio::test]
    async fn test_serves_fixed_status_line() {
        let (state, addr, server) = start().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, INVALID_ADDR);

        state.shutdown().await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_closes_silently() {
        let (state, addr, server) = start().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"\x00\x01\x02 nonsense\r\n\r\n").await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        state.shutdown().await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (state, addr, server) = start().await;

        // Holds the only slot until the header timeout: the head never completes.
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"CONNECT ").await.unwrap();
        while state.metrics.active_connections.get() == 0 {
            tokio::task::yield_now().await;
        }

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).await.unwrap(), 0);
        assert_eq!(state.metrics.refused_connections.get(), 1);

        state.shutdown().await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stalled_head_releases_slot() {
        let mut config = Config::default();
        config.proxy.header_timeout_ms = 100;
        let (state, addr, server) = start_with(config).await;

        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(b"CONNECT ").await.unwrap();
        let mut buf = [0u8; 1];
        let closed = tokio::time::timeout(Duration::from_secs(10), stalled.read(&mut buf))
            .await
            .expect("stalled connection was never closed");
        assert_eq!(closed.unwrap(), 0);
        while state.metrics.active_connections.get() != 0 {
            tokio::task::yield_now().await;
        }

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, INVALID_ADDR);
        assert_eq!(state.metrics.refused_connections.get(), 0);

        state.shutdown().await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_timeout_ends_connection() {
        let proxy = TunnelProxy::new(Default::default()).unwrap();
        let (mut client, server_side) = tokio::io::duplex(1024);
        client.write_all(b"CONNECT ").await.unwrap();

        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let started = tokio::time::Instant::now();
        handle_connection(&proxy, server_side, peer, Duration::from_secs(10)).await;
        assert!(started.elapsed() >= Duration::from_secs(10));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.proxy.host = "127.0.0.1".into();
        config.proxy.port = listener.local_addr().unwrap().port();
        let (state, _rx) = AppState::new(config);
        let proxy = Arc::new(TunnelProxy::new(state.proxy_options(None).await).unwrap());

        let err = ProxyServer::new(state, proxy).run().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }
}
