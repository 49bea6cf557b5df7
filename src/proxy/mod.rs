//! CONNECT tunneling.
//!
//! A [`TunnelProxy`] answers CONNECT requests in one of two roles. As an exit
//! it dials the requested target directly. As a relay it dials the peer named
//! by the request's relay header over the fabric's virtual network and asks
//! that peer, in turn, to CONNECT to the target. Either way the client gets a
//! fixed status line and, on success, a raw byte tunnel.

use async_trait::async_trait;
use http::StatusCode;
use std::io;

use crate::error::TunnelError;
use crate::transport::AsyncStream;

pub mod handshake;
pub mod transfer;
pub mod tunnel;

pub use handshake::ReplayStream;
pub use transfer::{transfer, TransferStats};
pub use tunnel::{ProxyOptions, TunnelProxy};

/// The hosting server's side of one request: either hand over the raw
/// connection, or answer through the regular response path.
#[async_trait]
pub trait ResponseWriter: Send {
    type Conn: AsyncStream;

    /// Takes over the underlying connection, including anything the server
    /// already buffered. Writers that cannot do this keep the default.
    fn hijack(&mut self) -> Result<Self::Conn, TunnelError> {
        Err(TunnelError::HijackUnsupported)
    }

    /// Sends a bodiless response with `status`.
    async fn write_status(&mut self, status: StatusCode) -> io::Result<()>;
}
