use std::sync::Arc;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{AsyncStream, BufferPool, PooledBuffer};

/// Bytes moved in each direction by one tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Client to outbound.
    pub upstream: u64,
    /// Outbound to client.
    pub downstream: u64,
}

impl TransferStats {
    pub fn total(&self) -> u64 {
        self.upstream + self.downstream
    }
}

/// Copies between `client` and `outbound` until either side ends.
///
/// Outbound→client runs on a spawned task, client→outbound on the caller's.
/// The first loop to see EOF or an error cancels the other, and both
/// connections are dropped before this returns.
pub async fn transfer<A, B>(client: A, outbound: B, pool: &Arc<BufferPool>) -> TransferStats
where
    A: AsyncStream,
    B: AsyncStream,
{
    let (client_read, client_write) = split(client);
    let (outbound_read, outbound_write) = split(outbound);
    let closed = CancellationToken::new();

    let downstream = tokio::spawn(copy_until_closed(
        outbound_read,
        client_write,
        pool.get(),
        closed.clone(),
    ));
    let upstream = copy_until_closed(client_read, outbound_write, pool.get(), closed.clone()).await;

    let downstream = match downstream.await {
        Ok(n) => n,
        Err(e) => {
            debug!("Downstream copy task failed: {}", e);
            0
        }
    };

    TransferStats {
        upstream,
        downstream,
    }
}

async fn copy_until_closed<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    mut buf: PooledBuffer,
    closed: CancellationToken,
) -> u64
where
    R: AsyncStream,
    W: AsyncStream,
{
    let mut copied = 0u64;
    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read(&mut buf[..]) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Tunnel read ended: {}", e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            _ = closed.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("Tunnel write ended: {}", e);
            break;
        }
        copied += n as u64;
    }

    closed.cancel();
    let _ = writer.shutdown().await;
    copied
}
