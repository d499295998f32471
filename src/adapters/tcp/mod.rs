//! Shared TCP adapter utilities.
//!
//! Connection handling and codec abstractions for the node servers.

pub mod codec;
pub mod connection;

use bytes::{Bytes, BytesMut};

use crate::core::error::{MockError, MockResult};

/// Result of decoding a frame from the wire.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded.
    Complete(T),
    /// More data is needed to complete the frame.
    Incomplete,
    /// The input is invalid.
    Invalid(String),
}

/// Result of encoding a response to the wire.
#[derive(Debug)]
pub enum EncodeResult {
    /// Successfully encoded.
    Ok(Bytes),
    /// Encoding failed.
    Error(String),
}

/// Read buffer for streaming protocol parsing.
#[derive(Debug)]
pub struct ReadBuffer {
    /// Internal buffer.
    buffer: BytesMut,

    /// Maximum buffer size.
    max_size: usize,
}

impl ReadBuffer {
    /// Create a new read buffer.
    pub fn new(capacity: usize, max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_size,
        }
    }

    /// Append data to the buffer.
    pub fn extend(&mut self, data: &[u8]) -> MockResult<()> {
        if self.buffer.len() + data.len() > self.max_size {
            return Err(MockError::protocol(format!(
                "buffer overflow: {} + {} > {}",
                self.buffer.len(),
                data.len(),
                self.max_size
            )));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Get a reference to buffered data.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Buffered bytes, for codecs that consume in place.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Consume bytes from the front of the buffer.
    pub fn consume(&mut self, count: usize) {
        let _ = self.buffer.split_to(count);
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Get remaining capacity before max_size.
    pub fn remaining_capacity(&self) -> usize {
        self.max_size.saturating_sub(self.buffer.len())
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new(64 * 1024, 128 * 1024 * 1024) // 64KB initial, 128MB max
    }
}
