//! Memcached binary protocol parsing and encoding.
//!
//! All requests and responses use a 24-byte header followed by optional body:
//! - Byte 0: Magic (0x80 request, 0x81 response, 0x18 traced response)
//! - Byte 1: Opcode
//! - Bytes 2-3: Key length
//! - Byte 4: Extras length
//! - Byte 5: Data type
//! - Bytes 6-7: Status (response) / vbucket (request)
//! - Bytes 8-11: Total body length
//! - Bytes 12-15: Opaque
//! - Bytes 16-23: CAS

pub mod binary;
pub mod codec;

pub use binary::{decode_trace_duration, encode_trace_duration, Request, RequestHeader, Response};
pub use codec::{CodecState, MemcachedCodec};
