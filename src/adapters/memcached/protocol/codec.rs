//! Streaming binary codec.
//!
//! Frames are assembled in two steps: the fixed header is read first, then a
//! body of the length it declares.
//!
//! ```text
//!   AwaitingHeader ──(24 bytes)──► AssemblingBody ──(body_length bytes)──► Request
//!         ▲                                                                   │
//!         └───────────────────────────────────────────────────────────────────┘
//! ```

use bytes::BytesMut;

use super::binary::{Request, RequestHeader, Response};
use crate::adapters::memcached::HEADER_SIZE;
use crate::adapters::tcp::codec::ProtocolCodec;
use crate::adapters::tcp::{DecodeResult, EncodeResult};

/// Largest body the codec accepts before declaring the stream invalid.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Where the codec is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecState {
    #[default]
    AwaitingHeader,
    AssemblingBody { header: RequestHeader },
    /// A framing error was seen; nothing more is decoded until reset.
    Failed,
}

/// Binary-only memcached codec.
#[derive(Debug, Default)]
pub struct MemcachedCodec {
    state: CodecState,
}

impl MemcachedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CodecState {
        self.state
    }
}

impl ProtocolCodec for MemcachedCodec {
    type Request = Request;
    type Response = Response;

    fn decode(&mut self, buffer: &mut BytesMut) -> DecodeResult<Self::Request> {
        loop {
            match self.state {
                CodecState::Failed => return DecodeResult::Invalid("codec failed".to_string()),
                CodecState::AwaitingHeader => {
                    if buffer.len() < HEADER_SIZE {
                        return DecodeResult::Incomplete;
                    }
                    let header = match RequestHeader::parse(&buffer[..HEADER_SIZE]) {
                        Ok(header) => header,
                        Err(e) => {
                            self.state = CodecState::Failed;
                            return DecodeResult::Invalid(e.to_string());
                        }
                    };
                    if header.body_len() > MAX_BODY_SIZE {
                        self.state = CodecState::Failed;
                        return DecodeResult::Invalid(format!(
                            "body too large: {}",
                            header.body_len()
                        ));
                    }
                    let _ = buffer.split_to(HEADER_SIZE);
                    self.state = CodecState::AssemblingBody { header };
                }
                CodecState::AssemblingBody { header } => {
                    if buffer.len() < header.body_len() {
                        return DecodeResult::Incomplete;
                    }
                    let body = buffer.split_to(header.body_len()).freeze();
                    self.state = CodecState::AwaitingHeader;
                    return match Request::from_parts(header, body) {
                        Ok(request) => DecodeResult::Complete(request),
                        Err(e) => {
                            self.state = CodecState::Failed;
                            DecodeResult::Invalid(e.to_string())
                        }
                    };
                }
            }
        }
    }

    fn encode(&self, response: &Self::Response) -> EncodeResult {
        EncodeResult::Ok(response.encode())
    }

    fn protocol_name(&self) -> &'static str {
        "memcached-binary"
    }

    fn reset(&mut self) {
        self.state = CodecState::AwaitingHeader;
    }
}
