//! Narrow interfaces to the encrypted point-to-point fabric.
//!
//! The proxy never touches the fabric's crypto or packet forwarding. It only
//! needs to dial inside the virtual address space ([`VirtualNetwork`]) and to
//! tell the packet layer which peer owns a locally bound port
//! ([`PeerResolver`]).

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

use crate::transport::BoxedStream;

pub mod attribution;
pub mod device;
pub mod kernel;
pub mod key;
#[cfg(unix)]
pub mod uapi;

pub use attribution::PacketAttributor;
pub use device::{DeviceConfig, DeviceSetting, PeerConfig};
pub use kernel::KernelNetwork;
pub use key::PeerKey;
#[cfg(unix)]
pub use uapi::UapiClient;

/// Dial capability inside the fabric's virtual address space.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VirtualNetwork: Send + Sync + 'static {
    /// Opens a TCP connection to `remote`, bound to `local_port` (0 picks one).
    ///
    /// Callers bound the dial with a deadline; dropping the future cancels it.
    async fn dial_tcp(&self, local_port: u16, remote: SocketAddr) -> io::Result<BoxedStream>;
}

/// Maps a locally bound port to the peer that owns its traffic.
pub trait PeerResolver: Send + Sync + 'static {
    fn resolve(&self, port: u16) -> Option<PeerKey>;
}
