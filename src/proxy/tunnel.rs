use http::header::HeaderName;
use http::{Method, Request, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::handshake;
use super::transfer::{transfer, TransferStats};
use super::ResponseWriter;
use crate::config::Role;
use crate::error::{ConfigError, HandshakeError, TunnelError};
use crate::fabric::VirtualNetwork;
use crate::state::metrics::{Metrics, TunnelTimer};
use crate::transport::{BoxedStream, BufferPool};

pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
pub const INVALID_ADDR: &[u8] = b"HTTP/1.1 400 invalid addr\r\n\r\n";
pub const INVALID_PEER_CONN_ADDR: &[u8] = b"HTTP/1.1 400 invalid peer conn addr header\r\n\r\n";
pub const CONNECT_FAILED: &[u8] = b"HTTP/1.1 502 can not connect target addr\r\n\r\n";
pub const INTERNAL_ERROR: &[u8] = b"HTTP/1.1 505 can not connect target addr\r\n\r\n";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RELAY_HEADER: &str = "PeerConnAddr";

impl TunnelError {
    /// Status line reported to the client, if the client can still be told.
    pub fn status_line(&self) -> Option<&'static [u8]> {
        match self {
            TunnelError::InvalidTarget(_) => Some(INVALID_ADDR),
            TunnelError::InvalidRelayHeader(_) => Some(INVALID_PEER_CONN_ADDR),
            TunnelError::UpstreamUnreachable { .. } => Some(CONNECT_FAILED),
            TunnelError::DialFailed { .. } => Some(INTERNAL_ERROR),
            TunnelError::HijackUnsupported | TunnelError::ClientGone(_) => None,
        }
    }
}

/// Construction parameters for [`TunnelProxy`].
#[derive(Clone)]
pub struct ProxyOptions {
    pub role: Role,
    /// Required in the relay role.
    pub network: Option<Arc<dyn VirtualNetwork>>,
    pub pool: Arc<BufferPool>,
    pub metrics: Arc<Metrics>,
    pub connect_timeout: Duration,
    pub relay_header: String,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            role: Role::Exit,
            network: None,
            pool: Arc::new(BufferPool::with_defaults()),
            metrics: Arc::new(Metrics::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            relay_header: DEFAULT_RELAY_HEADER.to_string(),
        }
    }
}

impl ProxyOptions {
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn VirtualNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// CONNECT tunneling proxy in either the exit or the relay role.
pub struct TunnelProxy {
    role: Role,
    network: Option<Arc<dyn VirtualNetwork>>,
    pool: Arc<BufferPool>,
    metrics: Arc<Metrics>,
    connect_timeout: Duration,
    relay_header: HeaderName,
}

impl TunnelProxy {
    pub fn new(options: ProxyOptions) -> Result<Self, ConfigError> {
        if options.role == Role::Relay && options.network.is_none() {
            return Err(ConfigError::MissingField(
                "virtual network is required in the relay role".to_string(),
            ));
        }
        if options.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }
        let relay_header = HeaderName::from_bytes(options.relay_header.as_bytes()).map_err(|_| {
            ConfigError::Validation(format!(
                "Invalid relay header name '{}'",
                options.relay_header
            ))
        })?;

        Ok(Self {
            role: options.role,
            network: options.network,
            pool: options.pool,
            metrics: options.metrics,
            connect_timeout: options.connect_timeout,
            relay_header,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Entry point for one request read by the hosting server.
    ///
    /// Only CONNECT is handled; any other method is dropped without a response.
    pub async fn serve<W: ResponseWriter>(&self, request: Request<()>, writer: W) {
        if request.method() != Method::CONNECT {
            debug!(method = %request.method(), "Ignoring non-CONNECT request");
            return;
        }

        match self.tunnel(&request, writer).await {
            Ok(stats) => debug!(
                upstream = stats.upstream,
                downstream = stats.downstream,
                "Tunnel closed"
            ),
            Err(e) => debug!("Tunnel not established: {}", e),
        }
    }

    /// Runs one CONNECT request to completion.
    ///
    /// The client connection is dropped, and therefore closed, on every path.
    pub async fn tunnel<W: ResponseWriter>(
        &self,
        request: &Request<()>,
        mut writer: W,
    ) -> Result<TransferStats, TunnelError> {
        let mut client = match writer.hijack() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Cannot take over client connection: {}", e);
                if let Err(e) = writer.write_status(StatusCode::BAD_GATEWAY).await {
                    debug!("Failed to report hijack failure: {}", e);
                }
                return Err(e);
            }
        };

        let outbound = match self.open_outbound(request).await {
            Ok(outbound) => outbound,
            Err(e) => {
                if let Some(line) = e.status_line() {
                    // Best effort; the connection is closed either way.
                    let _ = client.write_all(line).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = client.write_all(ESTABLISHED).await {
            return Err(TunnelError::ClientGone(e));
        }

        let timer = TunnelTimer::new(self.metrics.clone());
        let stats = transfer(client, outbound, &self.pool).await;
        timer.finish(&stats);
        Ok(stats)
    }

    async fn open_outbound(&self, request: &Request<()>) -> Result<BoxedStream, TunnelError> {
        let target = target_addr(request);
        if !target.contains(':') {
            self.metrics.record_rejected_request();
            return Err(TunnelError::InvalidTarget(target));
        }
        info!(target = %target, role = ?self.role, "CONNECT");

        match (self.role, &self.network) {
            (Role::Relay, Some(network)) => {
                let relay = self.relay_addr(request).inspect_err(|_| {
                    self.metrics.record_rejected_request();
                })?;
                debug!(relay = %relay, "Relaying through fabric peer");
                self.dial_relay(network.as_ref(), relay, &target)
                    .await
                    .map_err(|source| {
                        self.metrics.record_dial_failure();
                        warn!(relay = %relay, target = %target, "Relay unreachable: {}", source);
                        TunnelError::UpstreamUnreachable {
                            addr: relay.to_string(),
                            source,
                        }
                    })
            }
            // Unreachable after construction; treat as a local dial failure.
            (Role::Relay, None) => Err(TunnelError::DialFailed {
                addr: target,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no virtual network",
                ),
            }),
            (Role::Exit, _) => self.dial_direct(&target).await.map_err(|source| {
                self.metrics.record_dial_failure();
                warn!(target = %target, "Dial failed: {}", source);
                TunnelError::DialFailed {
                    addr: target.clone(),
                    source,
                }
            }),
        }
    }

    fn relay_addr(&self, request: &Request<()>) -> Result<SocketAddr, TunnelError> {
        let value = request.headers().get(&self.relay_header);
        value
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<SocketAddr>().ok())
            .ok_or_else(|| {
                TunnelError::InvalidRelayHeader(
                    value.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
                )
            })
    }

    /// Dials the next hop inside the fabric and asks it to CONNECT onward.
    async fn dial_relay(
        &self,
        network: &dyn VirtualNetwork,
        relay: SocketAddr,
        target: &str,
    ) -> Result<BoxedStream, HandshakeError> {
        let handshake = async {
            let conn = network.dial_tcp(0, relay).await?;
            let stream = handshake::connect(conn, target).await?;
            Ok::<BoxedStream, HandshakeError>(Box::new(stream))
        };
        timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }

    async fn dial_direct(&self, target: &str) -> std::io::Result<BoxedStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// `host:port` named by a CONNECT request.
fn target_addr(request: &Request<()>) -> String {
    match request.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => request.uri().to_string(),
    }
}
