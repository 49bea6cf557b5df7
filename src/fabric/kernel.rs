use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpSocket;
use tracing::debug;

use super::VirtualNetwork;
use crate::transport::BoxedStream;

/// [`VirtualNetwork`] for fabrics whose virtual addresses are routed by the
/// host kernel (an interface brought up outside this process).
#[derive(Debug, Clone, Default)]
pub struct KernelNetwork {
    /// Source address inside the fabric; the kernel picks one when unset.
    local_addr: Option<IpAddr>,
}

impl KernelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_addr(mut self, addr: IpAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    fn bind_addr(&self, remote: &SocketAddr, local_port: u16) -> SocketAddr {
        let ip = match (self.local_addr, remote) {
            (Some(ip), _) if ip.is_ipv4() == remote.is_ipv4() => ip,
            (_, SocketAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (_, SocketAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, local_port)
    }
}

#[async_trait]
impl VirtualNetwork for KernelNetwork {
    async fn dial_tcp(&self, local_port: u16, remote: SocketAddr) -> io::Result<BoxedStream> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if local_port != 0 || self.local_addr.is_some() {
            let bind = self.bind_addr(&remote, local_port);
            socket.set_reuseaddr(true)?;
            socket.bind(bind)?;
        }

        let stream = socket.connect(remote).await?;
        stream.set_nodelay(true)?;
        debug!(
            local = ?stream.local_addr().ok(),
            remote = %remote,
            "Virtual network connection established"
        );
        Ok(Box::new(stream))
    }
}
