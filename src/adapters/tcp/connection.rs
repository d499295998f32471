//! TCP connection handling.
//!
//! Provides the per-connection context for protocol adapters, and the read
//! and write helpers used by the connection loop. Writes go through a
//! [`WritePlan`] so injected stalls and truncation act on the outbound byte
//! stream only.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::codec::ProtocolCodec;
use super::{DecodeResult, EncodeResult, ReadBuffer};
use crate::control::faults::WritePlan;
use crate::core::error::{MockError, MockResult};
use crate::net::tcp::ConnectionId;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is active.
    Active,
    /// A response is pending, then the connection closes.
    Closing,
    /// Connection is closed.
    Closed,
}

/// Connection statistics.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands processed.
    pub commands_processed: AtomicU64,
    /// Bytes received.
    pub bytes_received: AtomicU64,
    /// Bytes sent.
    pub bytes_sent: AtomicU64,
}

impl ConnectionStats {
    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Protocol connection context.
pub struct ProtocolConnection<C: ProtocolCodec> {
    /// Connection ID.
    pub id: ConnectionId,

    /// Remote address.
    pub remote_addr: SocketAddr,

    /// Connection state.
    pub state: ConnectionState,

    /// Protocol codec.
    pub codec: C,

    /// Read buffer.
    pub read_buffer: ReadBuffer,

    /// Encoded responses waiting to be written.
    pub write_buffer: BytesMut,

    /// Connection statistics.
    pub stats: Arc<ConnectionStats>,

    /// Connection creation time.
    pub created_at: Instant,
}

impl<C: ProtocolCodec> ProtocolConnection<C> {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, codec: C) -> Self {
        Self {
            id,
            remote_addr,
            state: ConnectionState::Active,
            codec,
            read_buffer: ReadBuffer::default(),
            write_buffer: BytesMut::with_capacity(64 * 1024),
            stats: Arc::new(ConnectionStats::default()),
            created_at: Instant::now(),
        }
    }

    /// Try to decode the next request from buffered input.
    pub fn try_decode(&mut self) -> DecodeResult<C::Request> {
        self.codec.decode(self.read_buffer.bytes_mut())
    }

    /// Encode a response to the write buffer.
    pub fn encode_response(&mut self, response: &C::Response) -> MockResult<()> {
        match self.codec.encode(response) {
            EncodeResult::Ok(bytes) => {
                self.write_buffer.extend_from_slice(&bytes);
                Ok(())
            }
            EncodeResult::Error(e) => Err(MockError::Internal { message: e }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Get connection age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Read data into a connection's buffer. Returns 0 when the peer closed.
pub async fn read_into_buffer<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    buffer: &mut ReadBuffer,
    max_read: usize,
) -> MockResult<usize> {
    let mut tmp = vec![0u8; max_read.min(buffer.remaining_capacity()).max(1)];
    let n = reader.read(&mut tmp).await?;
    if n == 0 {
        return Ok(0);
    }
    buffer.extend(&tmp[..n])?;
    Ok(n)
}

/// Flush the write buffer according to `plan`. Returns the bytes written.
pub async fn write_planned<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    buffer: &mut BytesMut,
    plan: WritePlan,
) -> MockResult<usize> {
    if buffer.is_empty() {
        return Ok(0);
    }

    let (first, pause, keep_rest) = plan.split(buffer.len());
    writer.write_all(&buffer[..first]).await?;
    let mut written = first;

    if let Some(delay) = pause {
        writer.flush().await?;
        tokio::time::sleep(delay).await;
    }
    if keep_rest && first < buffer.len() {
        writer.write_all(&buffer[first..]).await?;
        written = buffer.len();
    }
    writer.flush().await?;

    buffer.clear();
    Ok(written)
}
