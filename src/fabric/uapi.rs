//! Client for the cross-platform WireGuard UAPI configuration socket.

use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::FabricError;

/// Directory in which fabric daemons create their UAPI sockets.
pub const SOCKET_DIR: &str = "/var/run/wireguard";

#[derive(Debug, Clone)]
pub struct UapiClient {
    path: PathBuf,
}

impl UapiClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Client for the socket of the named interface under [`SOCKET_DIR`].
    pub fn for_interface(interface: &str) -> Self {
        Self::new(Path::new(SOCKET_DIR).join(format!("{interface}.sock")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies a `set` operation and checks the daemon's `errno` reply.
    pub async fn set(&self, request: &str) -> Result<(), FabricError> {
        let stream = UnixStream::connect(&self.path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut message = String::with_capacity(request.len() + 8);
        message.push_str("set=1\n");
        message.push_str(request);
        if !request.ends_with('\n') {
            message.push('\n');
        }
        message.push('\n');
        write_half.write_all(message.as_bytes()).await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(FabricError::UapiReply("connection closed without errno".into()));
            }
            let trimmed = line.trim_end();
            if let Some(value) = trimmed.strip_prefix("errno=") {
                let errno: i32 = value
                    .parse()
                    .map_err(|_| FabricError::UapiReply(trimmed.to_string()))?;
                debug!(socket = %self.path.display(), errno, "UAPI set completed");
                return if errno == 0 {
                    Ok(())
                } else {
                    Err(FabricError::UapiErrno(errno))
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    async fn serve_once(listener: UnixListener, reply: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.ends_with(b"\n\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        stream.write_all(reply.as_bytes()).await.unwrap();
        String::from_utf8(received).unwrap()
    }

    #[test]
    fn test_socket_path_for_interface() {
        let client = UapiClient::for_interface("wg1");
        assert_eq!(client.path(), Path::new("/var/run/wireguard/wg1.sock"));
    }

    #[tokio::test]
    async fn test_set_sends_request_and_accepts_errno_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg-test.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(listener, "errno=0\n\n"));

        let client = UapiClient::new(&path);
        client.set("listen_port=51820\n").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, "set=1\nlisten_port=51820\n\n");
    }

    #[tokio::test]
    async fn test_set_reports_nonzero_errno() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg-test.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(listener, "errno=22\n\n"));

        let err = UapiClient::new(&path).set("bogus=1").await.unwrap_err();
        assert!(matches!(err, FabricError::UapiErrno(22)));
        server.await.unwrap();
    }
}
