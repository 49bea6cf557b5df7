use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use http::header::HeaderName;
use regex::Regex;
use std::net::IpAddr;
use std::path::Path;
use tokio::sync::Semaphore;

use super::schema::Config;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "FABRIC_TUNNEL_";

/// Longest accepted port-peer cache TTL.
pub const MAX_PEER_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("fabric-tunnel.toml"))
        .merge(Json::file("fabric-tunnel.json"))
        .merge(Yaml::file("fabric-tunnel.yaml"))
        .merge(Yaml::file("fabric-tunnel.yml"))
        // Override with environment variables (FABRIC_TUNNEL_ prefix)
        .merge(Env::prefixed(ENV_PREFIX).split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let proxy = &config.proxy;

    if proxy.connect_timeout_ms == 0 {
        return Err(ConfigError::Validation("Connect timeout must be greater than 0".into()).into());
    }

    if proxy.header_timeout_ms == 0 {
        return Err(ConfigError::Validation("Header timeout must be greater than 0".into()).into());
    }

    if proxy.peer_cache_ttl_secs == 0 {
        return Err(ConfigError::Validation("Peer cache TTL must be greater than 0".into()).into());
    }

    if proxy.peer_cache_ttl_secs > MAX_PEER_CACHE_TTL_SECS {
        return Err(ConfigError::Validation(format!(
            "Peer cache TTL must be at most {} seconds",
            MAX_PEER_CACHE_TTL_SECS
        ))
        .into());
    }

    if proxy.max_connections == 0 {
        return Err(ConfigError::Validation("Max connections must be greater than 0".into()).into());
    }

    if proxy.max_connections > Semaphore::MAX_PERMITS {
        return Err(ConfigError::Validation(format!(
            "Max connections must be at most {}",
            Semaphore::MAX_PERMITS
        ))
        .into());
    }

    if proxy.buffer_pool_size == 0 {
        return Err(ConfigError::Validation("Buffer pool size must be greater than 0".into()).into());
    }

    if HeaderName::from_bytes(proxy.relay_header.as_bytes()).is_err() {
        return Err(ConfigError::Validation(format!(
            "Relay header '{}' is not a valid header name",
            proxy.relay_header
        ))
        .into());
    }

    if let Some(addr) = &config.fabric.local_address {
        if addr.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Fabric local address '{}' is not an IP address",
                addr
            ))
            .into());
        }
    }

    if let Some(device) = &config.device {
        device.validate()?;
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(device) = &mut config.device {
        for peer in &mut device.peers {
            if let Some(endpoint) = &mut peer.endpoint {
                *endpoint = substitute_env_vars(endpoint)?;
            }
        }
    }

    if let Some(socket) = &mut config.fabric.uapi_socket {
        if let Some(raw) = socket.to_str() {
            *socket = substitute_env_vars(raw)?.into();
        }
    }

    if let Some(addr) = &mut config.fabric.local_address {
        *addr = substitute_env_vars(addr)?;
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
