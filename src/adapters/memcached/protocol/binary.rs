//! Memcached binary protocol frames.
//!
//! The binary protocol uses fixed-size headers followed by variable-size bodies.
//!
//! # Header Format (24 bytes)
//!
//! ```text
//! Request:
//! Byte/     0       |       1       |       2       |       3       |
//!    /              |               |               |               |
//!   |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
//!   +---------------+---------------+---------------+---------------+
//!  0| Magic         | Opcode        | Key length                    |
//!   +---------------+---------------+---------------+---------------+
//!  4| Extras length | Data type     | vbucket id                    |
//!   +---------------+---------------+---------------+---------------+
//!  8| Total body length                                             |
//!   +---------------+---------------+---------------+---------------+
//! 12| Opaque                                                        |
//!   +---------------+---------------+---------------+---------------+
//! 16| CAS                                                           |
//!   |                                                               |
//!   +---------------+---------------+---------------+---------------+
//!
//! Response:
//! Byte/     0       |       1       |       2       |       3       |
//!    /              |               |               |               |
//!   |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
//!   +---------------+---------------+---------------+---------------+
//!  0| Magic         | Opcode        | Key length                    |
//!   +---------------+---------------+---------------+---------------+
//!  4| Extras length | Data type     | Status                        |
//!   +---------------+---------------+---------------+---------------+
//!  8| Total body length                                             |
//!   +---------------+---------------+---------------+---------------+
//! 12| Opaque                                                        |
//!   +---------------+---------------+---------------+---------------+
//! 16| CAS                                                           |
//!   |                                                               |
//!   +---------------+---------------+---------------+---------------+
//! ```
//!
//! A traced response uses magic `0x18` and splits the key length field into
//! a framing extras length (byte 2) and an 8-bit key length (byte 3). The
//! framing extras sit between the header and the regular extras:
//!
//! ```text
//!   0x02 | encoded server duration (u16)
//! ```
//!
//! # Body Format
//!
//! Body = [Framing extras] + Extras + Key + Value

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::adapters::memcached::{
    Opcode, ALT_RESPONSE_MAGIC, HEADER_SIZE, REQUEST_MAGIC, RESPONSE_MAGIC,
};
use crate::core::error::{ErrorCode, MockError, MockResult};
use crate::storage::datatype;

/// Longest server duration the tracing frame can express, in microseconds.
pub const MAX_TRACE_MICROS: u128 = 120_125_042;

/// Framing extras id (0) and length (2) of the server duration frame.
const TRACE_FRAME_TAG: u8 = 0x02;

/// Encode a server duration for the tracing frame.
pub fn encode_trace_duration(elapsed: Duration) -> u16 {
    let micros = elapsed.as_micros().min(MAX_TRACE_MICROS) as f64;
    (2.0 * micros).powf(1.0 / 1.74).round() as u16
}

/// Approximate duration carried by an encoded tracing value.
pub fn decode_trace_duration(encoded: u16) -> Duration {
    let micros = (encoded as f64).powf(1.74) / 2.0;
    Duration::from_micros(micros as u64)
}

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Parse the first [`HEADER_SIZE`] bytes of `data`.
    pub fn parse(data: &[u8]) -> MockResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(MockError::protocol("short header"));
        }
        let mut buf = &data[..HEADER_SIZE];
        let header = Self {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            key_length: buf.get_u16(),
            extras_length: buf.get_u8(),
            datatype: buf.get_u8(),
            vbucket: buf.get_u16(),
            body_length: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        };
        if header.magic != REQUEST_MAGIC {
            return Err(MockError::protocol(format!(
                "invalid magic: 0x{:02x}",
                header.magic
            )));
        }
        if header.extras_length as usize + header.key_length as usize > header.body_length as usize {
            return Err(MockError::protocol(format!(
                "extras ({}) and key ({}) exceed body ({})",
                header.extras_length, header.key_length, header.body_length
            )));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> usize {
        self.body_length as usize
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extras_length);
        buf.put_u8(self.datatype);
        buf.put_u16(self.vbucket);
        buf.put_u32(self.body_length);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }
}

/// A complete request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            header: RequestHeader {
                magic: REQUEST_MAGIC,
                opcode: opcode.code(),
                ..RequestHeader::default()
            },
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Split a received body according to its header.
    pub fn from_parts(header: RequestHeader, mut body: Bytes) -> MockResult<Self> {
        if body.len() != header.body_len() {
            return Err(MockError::protocol(format!(
                "body length mismatch: expected {}, got {}",
                header.body_len(),
                body.len()
            )));
        }
        let extras = body.split_to(header.extras_length as usize);
        let key = body.split_to(header.key_length as usize);
        Ok(Self {
            header,
            extras,
            key,
            value: body,
        })
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.header.vbucket = vbucket;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.header.cas = cas;
        self
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.header.opaque = opaque;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.header.datatype = datatype;
        self
    }

    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    /// Encode with lengths recomputed from the parts.
    pub fn encode(&self) -> Bytes {
        let mut header = self.header;
        header.key_length = self.key.len() as u16;
        header.extras_length = self.extras.len() as u8;
        header.body_length = (self.extras.len() + self.key.len() + self.value.len()) as u32;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + header.body_len());
        header.encode(&mut buf);
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf.freeze()
    }
}

/// A response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub status: ErrorCode,
    pub opaque: u32,
    pub cas: u64,
    pub datatype: u8,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
    /// Server duration, sent as a tracing frame.
    pub trace: Option<Duration>,
}

impl Response {
    pub fn new(opcode: u8, opaque: u32) -> Self {
        Self {
            opcode,
            status: ErrorCode::Success,
            opaque,
            cas: 0,
            datatype: datatype::RAW,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
            trace: None,
        }
    }

    /// Empty response answering `request` with `status`.
    pub fn for_request(request: &Request, status: ErrorCode) -> Self {
        Self::new(request.opcode(), request.header.opaque).with_status(status)
    }

    pub fn with_status(mut self, status: ErrorCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Set a JSON value and flag the datatype accordingly.
    pub fn with_json(self, value: impl Into<Bytes>) -> Self {
        self.with_value(value).with_datatype(datatype::JSON)
    }

    pub fn with_trace(mut self, elapsed: Duration) -> Self {
        self.trace = Some(elapsed);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    fn body_len(&self) -> usize {
        let framing = if self.trace.is_some() { 3 } else { 0 };
        framing + self.extras.len() + self.key.len() + self.value.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        match self.trace {
            Some(_) => {
                buf.put_u8(ALT_RESPONSE_MAGIC);
                buf.put_u8(self.opcode);
                buf.put_u8(3);
                buf.put_u8(self.key.len() as u8);
            }
            None => {
                buf.put_u8(RESPONSE_MAGIC);
                buf.put_u8(self.opcode);
                buf.put_u16(self.key.len() as u16);
            }
        }
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(self.status.code());
        buf.put_u32(self.body_len() as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        if let Some(elapsed) = self.trace {
            buf.put_u8(TRACE_FRAME_TAG);
            buf.put_u16(encode_trace_duration(elapsed));
        }
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse one response from the front of `data`.
    ///
    /// Returns `None` until a complete frame is available, otherwise the
    /// response and the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> MockResult<Option<(Self, usize)>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut buf = &data[..HEADER_SIZE];
        let magic = buf.get_u8();
        let opcode = buf.get_u8();
        let (framing_len, key_len) = match magic {
            RESPONSE_MAGIC => (0usize, buf.get_u16() as usize),
            ALT_RESPONSE_MAGIC => (buf.get_u8() as usize, buf.get_u8() as usize),
            other => {
                return Err(MockError::protocol(format!(
                    "invalid response magic: 0x{:02x}",
                    other
                )))
            }
        };
        let extras_len = buf.get_u8() as usize;
        let datatype = buf.get_u8();
        let status = ErrorCode::try_from(buf.get_u16())?;
        let body_len = buf.get_u32() as usize;
        let opaque = buf.get_u32();
        let cas = buf.get_u64();

        let total = HEADER_SIZE + body_len;
        if data.len() < total {
            return Ok(None);
        }
        if framing_len + extras_len + key_len > body_len {
            return Err(MockError::protocol("response sections exceed body"));
        }

        let mut body = Bytes::copy_from_slice(&data[HEADER_SIZE..total]);
        let framing = body.split_to(framing_len);
        let trace = match framing.as_ref() {
            [TRACE_FRAME_TAG, hi, lo] => Some(decode_trace_duration(u16::from_be_bytes([*hi, *lo]))),
            _ => None,
        };
        let extras = body.split_to(extras_len);
        let key = body.split_to(key_len);

        Ok(Some((
            Self {
                opcode,
                status,
                opaque,
                cas,
                datatype,
                extras,
                key,
                value: body,
                trace,
            },
            total,
        )))
    }
}
