//! Egress packet attribution.
//!
//! A single fabric interface carries connections on behalf of several peers.
//! When an outbound packet leaves the virtual stack, its source port decides
//! which peer it belongs to.

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::sync::Arc;
use tracing::trace;

use super::{PeerKey, PeerResolver};

pub struct PacketAttributor {
    resolver: Arc<dyn PeerResolver>,
}

impl PacketAttributor {
    pub fn new(resolver: Arc<dyn PeerResolver>) -> Self {
        Self { resolver }
    }

    /// Peer owning the packet's source port, if any.
    pub fn peer_for_packet(&self, packet: &[u8]) -> Option<PeerKey> {
        let port = source_port(packet)?;
        let peer = self.resolver.resolve(port);
        trace!(port, found = peer.is_some(), "Attributing egress packet");
        peer
    }
}

/// Source port of an IPv4/IPv6 TCP or UDP packet.
///
/// IPv6 extension headers are not walked; such packets yield `None`.
pub fn source_port(packet: &[u8]) -> Option<u16> {
    let (protocol, payload) = match packet.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new_checked(packet).ok()?;
            (ip.next_header(), ip.payload())
        }
        6 => {
            let ip = Ipv6Packet::new_checked(packet).ok()?;
            (ip.next_header(), ip.payload())
        }
        _ => return None,
    };

    match protocol {
        IpProtocol::Tcp => TcpPacket::new_checked(payload).ok().map(|p| p.src_port()),
        IpProtocol::Udp => UdpPacket::new_checked(payload).ok().map(|p| p.src_port()),
        _ => None,
    }
}
