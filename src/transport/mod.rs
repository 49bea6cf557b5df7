use tokio::io::{AsyncRead, AsyncWrite};

pub mod conn_buffer;
pub mod pool;

pub use conn_buffer::{ConnBuffer, HandoffBuffers};
pub use pool::{BufferPool, PooledBuffer, COPY_BUFFER_SIZE};

/// Byte stream usable as either leg of a tunnel.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased outbound connection (direct socket or wrapped virtual socket).
pub type BoxedStream = Box<dyn AsyncStream>;
