use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Failures of a single CONNECT request.
///
/// Every variant that can still be reported to the client maps to exactly one
/// fixed status line, see [`TunnelError::status_line`].
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Connection does not support hijacking")]
    HijackUnsupported,

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    #[error("Invalid relay header: {0:?}")]
    InvalidRelayHeader(Option<String>),

    #[error("Upstream {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: String,
        #[source]
        source: HandshakeError,
    },

    #[error("Dial to {addr} failed: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Client went away before the tunnel was established: {0}")]
    ClientGone(#[source] io::Error),
}

/// Failures of the inner CONNECT handshake performed by a relay.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Connection error: {0}")]
    Io(#[from] io::Error),

    #[error("Dial timed out")]
    Timeout,

    #[error("Connection closed before the response head was complete")]
    Closed,

    #[error("Malformed response head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("Response head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Upstream refused the tunnel with status {0}")]
    Status(u16),
}

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Invalid peer key: {0}")]
    InvalidKey(String),

    #[error("UAPI socket error: {0}")]
    Uapi(#[from] io::Error),

    #[error("UAPI request rejected with errno {0}")]
    UapiErrno(i32),

    #[error("Unexpected UAPI reply: {0}")]
    UapiReply(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
