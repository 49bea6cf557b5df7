//! Fabric device configuration and its UAPI rendering.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::IpAddr;

use super::PeerKey;
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub private_key: PeerKey,
    #[serde(default)]
    pub listen_port: u16,
    /// Addresses assigned to this node inside the virtual network.
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub public_key: PeerKey,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub keepalive: u16,
    #[serde(default)]
    pub preshared_key: Option<PeerKey>,
    /// CIDR prefixes routed to this peer. Empty means everything.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// Everything needed to bring a fabric interface up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSetting {
    pub ipc_request: String,
    pub dns: Vec<IpAddr>,
    pub addresses: Vec<IpAddr>,
    pub mtu: u16,
    /// No DNS servers configured: resolve through the host instead.
    pub system_dns: bool,
}

fn default_mtu() -> u16 {
    1420
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.private_key.is_zero() {
            return Err(ConfigError::Validation("Device private key is zero".into()));
        }
        if self.mtu < 576 {
            return Err(ConfigError::Validation(format!(
                "MTU {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        for peer in &self.peers {
            if peer.public_key.is_zero() {
                return Err(ConfigError::Validation("Peer public key is zero".into()));
            }
            for cidr in &peer.allowed_ips {
                if !is_valid_cidr(cidr) {
                    return Err(ConfigError::Validation(format!(
                        "Peer {} has invalid allowed IP '{}'",
                        peer.public_key, cidr
                    )));
                }
            }
        }
        Ok(())
    }

    /// Renders the UAPI `set` body for this device.
    pub fn ipc_request(&self) -> String {
        let mut request = String::new();
        let _ = writeln!(request, "private_key={}", self.private_key.to_hex());
        let _ = writeln!(request, "listen_port={}", self.listen_port);

        for peer in &self.peers {
            let _ = writeln!(request, "public_key={}", peer.public_key.to_hex());
            if let Some(endpoint) = peer.endpoint.as_deref().filter(|e| !e.is_empty()) {
                let _ = writeln!(request, "endpoint={endpoint}");
            }
            let _ = writeln!(request, "persistent_keepalive_interval={}", peer.keepalive);
            let psk = peer
                .preshared_key
                .unwrap_or(PeerKey::from_bytes([0; super::key::KEY_LEN]));
            let _ = writeln!(request, "preshared_key={}", psk.to_hex());

            if peer.allowed_ips.is_empty() {
                request.push_str("allowed_ip=0.0.0.0/0\nallowed_ip=::0/0\n");
            } else {
                for cidr in &peer.allowed_ips {
                    let _ = writeln!(request, "allowed_ip={cidr}");
                }
            }
        }

        request
    }

    pub fn setting(&self) -> DeviceSetting {
        DeviceSetting {
            ipc_request: self.ipc_request(),
            dns: self.dns.clone(),
            addresses: self.addresses.clone(),
            mtu: self.mtu,
            system_dns: self.dns.is_empty(),
        }
    }
}

fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}
