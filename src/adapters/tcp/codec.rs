//! Protocol codec traits.
//!
//! Defines the interface for encoding/decoding protocol frames.

use super::{DecodeResult, EncodeResult};
use bytes::BytesMut;

/// Trait for protocol codecs.
///
/// A codec handles encoding responses and decoding requests for a specific
/// wire protocol. Codecs may carry state between calls when a frame arrives
/// in several reads.
pub trait ProtocolCodec: Send + Sync {
    /// The request type decoded from the wire.
    type Request;

    /// The response type encoded to the wire.
    type Response;

    /// Attempt to decode a request from the buffer.
    ///
    /// Returns:
    /// - `Complete(request)` if a full request was decoded
    /// - `Incomplete` if more data is needed
    /// - `Invalid(error)` if the data is malformed
    ///
    /// Decoded bytes are consumed from the buffer.
    fn decode(&mut self, buffer: &mut BytesMut) -> DecodeResult<Self::Request>;

    /// Encode a response to bytes.
    fn encode(&self, response: &Self::Response) -> EncodeResult;

    /// Get the protocol name.
    fn protocol_name(&self) -> &'static str;

    /// Reset any internal state (e.g., after protocol error).
    fn reset(&mut self) {}
}
