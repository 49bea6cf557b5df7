use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::fabric::DeviceConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub fabric: FabricConfig,
    /// Interface settings pushed over UAPI at startup, when present.
    #[serde(default)]
    pub device: Option<DeviceConfig>,
}

/// Which hop of a tunnel chain this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dials CONNECT targets directly.
    #[default]
    Exit,
    /// Forwards CONNECT requests to a peer inside the fabric.
    Relay,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Deadline for a client to finish sending its request head.
    #[serde(default = "default_header_timeout")]
    pub header_timeout_ms: u64,
    #[serde(default = "default_relay_header")]
    pub relay_header: String,
    #[serde(default = "default_peer_cache_ttl")]
    pub peer_cache_ttl_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,
    /// Serves the Prometheus registry on this port when set.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
            host: default_proxy_host(),
            role: Role::default(),
            connect_timeout_ms: default_connect_timeout(),
            header_timeout_ms: default_header_timeout(),
            relay_header: default_relay_header(),
            peer_cache_ttl_secs: default_peer_cache_ttl(),
            max_connections: default_max_connections(),
            buffer_pool_size: default_buffer_pool_size(),
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Overrides the UAPI socket derived from `interface`.
    #[serde(default)]
    pub uapi_socket: Option<PathBuf>,
    /// Source address for dials inside the fabric.
    #[serde(default)]
    pub local_address: Option<String>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            uapi_socket: None,
            local_address: None,
        }
    }
}

// Default value functions
fn default_proxy_port() -> u16 {
    13033
}

fn default_proxy_host() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_header_timeout() -> u64 {
    10_000
}

fn default_relay_header() -> String {
    crate::proxy::tunnel::DEFAULT_RELAY_HEADER.to_string()
}

fn default_peer_cache_ttl() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_pool_size() -> usize {
    crate::transport::pool::DEFAULT_POOL_CAPACITY
}

fn default_interface() -> String {
    "wg1".to_string()
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.connect_timeout_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.header_timeout_ms)
    }

    pub fn peer_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.proxy.peer_cache_ttl_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    pub fn metrics_addr(&self) -> Option<String> {
        self.proxy
            .metrics_port
            .map(|port| format!("{}:{}", self.proxy.host, port))
    }
}
