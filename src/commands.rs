use serde_json::json;
use tracing::{info, warn};

use crate::config::{Config, Role};
use crate::error::Result;
use crate::fabric::DeviceConfig;

pub async fn run_config_check(config: Config, show_keys: bool, as_json: bool) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    if as_json {
        println!("{}", serde_json::to_string_pretty(&check_report(&config, show_keys))?);
        return Ok(());
    }

    info!("  Listen: {}", config.listen_addr());
    info!("  Role: {:?}", config.proxy.role);
    info!("  Connect timeout: {:?}", config.connect_timeout());
    info!("  Header timeout: {:?}", config.header_timeout());
    if let Some(addr) = config.metrics_addr() {
        info!("  Metrics: http://{}/metrics", addr);
    }
    info!("  Peer cache TTL: {:?}", config.peer_cache_ttl());

    match &config.device {
        Some(device) => {
            let setting = device.setting();
            info!(
                "  Device: {} address(es), {} peer(s), mtu {}",
                setting.addresses.len(),
                device.peers.len(),
                setting.mtu
            );
            if setting.system_dns {
                info!("  DNS: system resolver");
            }
            println!("{}", render_ipc_request(device, !show_keys));
        }
        None if config.proxy.role == Role::Relay => {
            warn!("  ! Relay role without a device section; the fabric must be configured externally");
        }
        None => {}
    }

    info!("✓ All checks passed");
    Ok(())
}

/// Machine-readable summary of the effective configuration.
pub fn check_report(config: &Config, show_keys: bool) -> serde_json::Value {
    let device = config.device.as_ref().map(|device| {
        let setting = device.setting();
        json!({
            "addresses": setting.addresses,
            "dns": setting.dns,
            "systemDns": setting.system_dns,
            "mtu": setting.mtu,
            "peers": device.peers.len(),
            "ipcRequest": render_ipc_request(device, !show_keys),
        })
    });

    json!({
        "listen": config.listen_addr(),
        "role": config.proxy.role,
        "connectTimeoutMs": config.proxy.connect_timeout_ms,
        "headerTimeoutMs": config.proxy.header_timeout_ms,
        "metricsPort": config.proxy.metrics_port,
        "relayHeader": config.proxy.relay_header,
        "peerCacheTtlSecs": config.proxy.peer_cache_ttl_secs,
        "maxConnections": config.proxy.max_connections,
        "device": device,
    })
}

/// The UAPI request for `device`, optionally with secret key lines masked.
pub fn render_ipc_request(device: &DeviceConfig, redact: bool) -> String {
    let request = device.ipc_request();
    if !redact {
        return request;
    }
    request
        .lines()
        .map(|line| match line.split_once('=') {
            Some((key @ ("private_key" | "preshared_key"), _)) => format!("{key}=<redacted>"),
            _ => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pushes the configured device settings to the fabric's UAPI socket.
#[cfg(unix)]
pub async fn configure_device(config: &Config) -> Result<()> {
    use crate::fabric::UapiClient;

    let Some(device) = &config.device else {
        return Ok(());
    };

    let client = match &config.fabric.uapi_socket {
        Some(path) => UapiClient::new(path.clone()),
        None => UapiClient::for_interface(&config.fabric.interface),
    };
    info!("Configuring fabric device via {}", client.path().display());
    client.set(&device.ipc_request()).await?;
    info!("Fabric device configured with {} peer(s)", device.peers.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{PeerConfig, PeerKey};

    fn device() -> DeviceConfig {
        DeviceConfig {
            private_key: PeerKey::from_bytes([1; 32]),
            listen_port: 51820,
            addresses: vec![],
            dns: vec![],
            mtu: 1420,
            peers: vec![PeerConfig {
                public_key: PeerKey::from_bytes([2; 32]),
                endpoint: None,
                keepalive: 25,
                preshared_key: None,
                allowed_ips: vec![],
            }],
        }
    }

    #[test]
    fn test_render_redacts_secrets() {
        let rendered = render_ipc_request(&device(), true);
        assert!(rendered.contains("private_key=<redacted>"));
        assert!(rendered.contains("preshared_key=<redacted>"));
        assert!(rendered.contains(&format!(
            "public_key={}",
            PeerKey::from_bytes([2; 32]).to_hex()
        )));
        assert!(!rendered.contains(&PeerKey::from_bytes([1; 32]).to_hex()));
    }

    #[test]
    fn test_render_unredacted() {
        assert_eq!(render_ipc_request(&device(), false), device().ipc_request());
    }

    #[tokio::test]
    async fn test_check_accepts_default_config() {
        run_config_check(Config::default(), false, false).await.unwrap();
    }

    #[test]
    fn test_check_report() {
        let mut config = Config::default();
        config.proxy.role = Role::Relay;
        config.device = Some(device());

        let report = check_report(&config, false);
        assert_eq!(report["listen"], "0.0.0.0:13033");
        assert_eq!(report["role"], "relay");
        assert_eq!(report["headerTimeoutMs"], 10_000);
        assert!(report["metricsPort"].is_null());
        assert_eq!(report["device"]["peers"], 1);
        assert_eq!(report["device"]["systemDns"], true);
        assert!(report["device"]["ipcRequest"]
            .as_str()
            .unwrap()
            .contains("private_key=<redacted>"));

        assert!(check_report(&Config::default(), false)["device"].is_null());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configure_device_over_uapi() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("wg-test.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let daemon = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut received = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\n" || line.is_empty() {
                    break;
                }
                received.push_str(&line);
            }
            reader.get_mut().write_all(b"errno=0\n\n").await.unwrap();
            received
        });

        let mut config = Config::default();
        config.fabric.uapi_socket = Some(socket);
        config.device = Some(device());
        configure_device(&config).await.unwrap();

        let received = daemon.await.unwrap();
        assert!(received.starts_with("set=1\n"));
        assert!(received.contains("listen_port=51820\n"));
    }
}
