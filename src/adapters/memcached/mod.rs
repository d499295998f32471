//! Couchbase flavored memcached binary protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Node server (one per node)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TCP Listener                                               │
//! │    ↓                                                        │
//! │  MemcachedCodec: 24-byte header, then body                  │
//! │    ↓                                                        │
//! │  Dispatcher                                                 │
//! │    ├── failmaker, command log, auth gate                    │
//! │    ├── Storage: set, add, replace, append, prepend, delete  │
//! │    ├── Retrieval: get, getl, gat, touch, replica, random    │
//! │    ├── Arithmetic: incr, decr                               │
//! │    ├── Observe: observe, observe-seqno                      │
//! │    ├── Subdoc: single path and multi-spec                   │
//! │    └── Other: hello, sasl, stat, config, errmap, ...        │
//! │    ↓                                                        │
//! │  Storage fabric (cache, disk, replicas)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quiet Opcodes
//!
//! Quiet variants suppress the success response. The quiet gets (`GETQ`,
//! `GETKQ`, `GATQ`) invert that: they stay silent on a miss and answer a
//! hit.

pub mod commands;
pub mod protocol;
pub mod service;

pub use commands::{Dispatcher, Session};
pub use protocol::{MemcachedCodec, Request, RequestHeader, Response};
pub use service::{NodeServer, NodeServerConfig};

/// Request magic byte.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Response magic byte.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Response magic byte when framing extras (tracing) follow the header.
pub const ALT_RESPONSE_MAGIC: u8 = 0x18;

/// Fixed header size.
pub const HEADER_SIZE: usize = 24;

/// Binary protocol opcodes understood by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Verbosity = 0x1b,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    ObserveSeqno = 0x91,
    Observe = 0x92,
    GetLocked = 0x94,
    UnlockKey = 0x95,
    GetClusterConfig = 0xb5,
    GetRandomKey = 0xb6,
    SubdocGet = 0xc5,
    SubdocExists = 0xc6,
    SubdocDictAdd = 0xc7,
    SubdocDictUpsert = 0xc8,
    SubdocDelete = 0xc9,
    SubdocReplace = 0xca,
    SubdocArrayPushLast = 0xcb,
    SubdocArrayPushFirst = 0xcc,
    SubdocArrayInsert = 0xcd,
    SubdocArrayAddUnique = 0xce,
    SubdocCounter = 0xcf,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
    SubdocGetCount = 0xd2,
    GetErrorMap = 0xfe,
}

impl Opcode {
    const ALL: [Opcode; 58] = [
        Opcode::Get,
        Opcode::Set,
        Opcode::Add,
        Opcode::Replace,
        Opcode::Delete,
        Opcode::Increment,
        Opcode::Decrement,
        Opcode::Quit,
        Opcode::Flush,
        Opcode::GetQ,
        Opcode::Noop,
        Opcode::Version,
        Opcode::GetK,
        Opcode::GetKQ,
        Opcode::Append,
        Opcode::Prepend,
        Opcode::Stat,
        Opcode::SetQ,
        Opcode::AddQ,
        Opcode::ReplaceQ,
        Opcode::DeleteQ,
        Opcode::IncrementQ,
        Opcode::DecrementQ,
        Opcode::QuitQ,
        Opcode::FlushQ,
        Opcode::AppendQ,
        Opcode::PrependQ,
        Opcode::Verbosity,
        Opcode::Touch,
        Opcode::Gat,
        Opcode::GatQ,
        Opcode::Hello,
        Opcode::SaslListMechs,
        Opcode::SaslAuth,
        Opcode::SaslStep,
        Opcode::GetReplica,
        Opcode::SelectBucket,
        Opcode::ObserveSeqno,
        Opcode::Observe,
        Opcode::GetLocked,
        Opcode::UnlockKey,
        Opcode::GetClusterConfig,
        Opcode::GetRandomKey,
        Opcode::SubdocGet,
        Opcode::SubdocExists,
        Opcode::SubdocDictAdd,
        Opcode::SubdocDictUpsert,
        Opcode::SubdocDelete,
        Opcode::SubdocReplace,
        Opcode::SubdocArrayPushLast,
        Opcode::SubdocArrayPushFirst,
        Opcode::SubdocArrayInsert,
        Opcode::SubdocArrayAddUnique,
        Opcode::SubdocCounter,
        Opcode::SubdocMultiLookup,
        Opcode::SubdocMultiMutation,
        Opcode::SubdocGetCount,
        Opcode::GetErrorMap,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Check if this is a quiet opcode.
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            Opcode::GetQ
                | Opcode::GetKQ
                | Opcode::SetQ
                | Opcode::AddQ
                | Opcode::ReplaceQ
                | Opcode::DeleteQ
                | Opcode::IncrementQ
                | Opcode::DecrementQ
                | Opcode::QuitQ
                | Opcode::FlushQ
                | Opcode::AppendQ
                | Opcode::PrependQ
                | Opcode::GatQ
        )
    }

    /// Quiet gets answer hits and swallow misses.
    pub fn is_quiet_get(&self) -> bool {
        matches!(self, Opcode::GetQ | Opcode::GetKQ | Opcode::GatQ)
    }

    /// Get the non-quiet version of this opcode.
    pub fn to_non_quiet(&self) -> Opcode {
        match self {
            Opcode::GetQ => Opcode::Get,
            Opcode::GetKQ => Opcode::GetK,
            Opcode::SetQ => Opcode::Set,
            Opcode::AddQ => Opcode::Add,
            Opcode::ReplaceQ => Opcode::Replace,
            Opcode::DeleteQ => Opcode::Delete,
            Opcode::IncrementQ => Opcode::Increment,
            Opcode::DecrementQ => Opcode::Decrement,
            Opcode::QuitQ => Opcode::Quit,
            Opcode::FlushQ => Opcode::Flush,
            Opcode::AppendQ => Opcode::Append,
            Opcode::PrependQ => Opcode::Prepend,
            Opcode::GatQ => Opcode::Gat,
            other => *other,
        }
    }

    /// Opcodes a client may send before authenticating.
    pub fn allowed_before_auth(&self) -> bool {
        matches!(
            self,
            Opcode::SaslAuth
                | Opcode::SaslListMechs
                | Opcode::SaslStep
                | Opcode::Hello
                | Opcode::GetErrorMap
        )
    }

    /// Upper-case command name, as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Get => "GET",
            Opcode::Set => "SET",
            Opcode::Add => "ADD",
            Opcode::Replace => "REPLACE",
            Opcode::Delete => "DELETE",
            Opcode::Increment => "INCREMENT",
            Opcode::Decrement => "DECREMENT",
            Opcode::Quit => "QUIT",
            Opcode::Flush => "FLUSH",
            Opcode::GetQ => "GETQ",
            Opcode::Noop => "NOOP",
            Opcode::Version => "VERSION",
            Opcode::GetK => "GETK",
            Opcode::GetKQ => "GETKQ",
            Opcode::Append => "APPEND",
            Opcode::Prepend => "PREPEND",
            Opcode::Stat => "STAT",
            Opcode::SetQ => "SETQ",
            Opcode::AddQ => "ADDQ",
            Opcode::ReplaceQ => "REPLACEQ",
            Opcode::DeleteQ => "DELETEQ",
            Opcode::IncrementQ => "INCREMENTQ",
            Opcode::DecrementQ => "DECREMENTQ",
            Opcode::QuitQ => "QUITQ",
            Opcode::FlushQ => "FLUSHQ",
            Opcode::AppendQ => "APPENDQ",
            Opcode::PrependQ => "PREPENDQ",
            Opcode::Verbosity => "VERBOSITY",
            Opcode::Touch => "TOUCH",
            Opcode::Gat => "GAT",
            Opcode::GatQ => "GATQ",
            Opcode::Hello => "HELLO",
            Opcode::SaslListMechs => "SASL_LIST_MECHS",
            Opcode::SaslAuth => "SASL_AUTH",
            Opcode::SaslStep => "SASL_STEP",
            Opcode::GetReplica => "GET_REPLICA",
            Opcode::SelectBucket => "SELECT_BUCKET",
            Opcode::ObserveSeqno => "OBSERVE_SEQNO",
            Opcode::Observe => "OBSERVE",
            Opcode::GetLocked => "GET_LOCKED",
            Opcode::UnlockKey => "UNLOCK_KEY",
            Opcode::GetClusterConfig => "GET_CLUSTER_CONFIG",
            Opcode::GetRandomKey => "GET_RANDOM_KEY",
            Opcode::SubdocGet => "SUBDOC_GET",
            Opcode::SubdocExists => "SUBDOC_EXISTS",
            Opcode::SubdocDictAdd => "SUBDOC_DICT_ADD",
            Opcode::SubdocDictUpsert => "SUBDOC_DICT_UPSERT",
            Opcode::SubdocDelete => "SUBDOC_DELETE",
            Opcode::SubdocReplace => "SUBDOC_REPLACE",
            Opcode::SubdocArrayPushLast => "SUBDOC_ARRAY_PUSH_LAST",
            Opcode::SubdocArrayPushFirst => "SUBDOC_ARRAY_PUSH_FIRST",
            Opcode::SubdocArrayInsert => "SUBDOC_ARRAY_INSERT",
            Opcode::SubdocArrayAddUnique => "SUBDOC_ARRAY_ADD_UNIQUE",
            Opcode::SubdocCounter => "SUBDOC_COUNTER",
            Opcode::SubdocMultiLookup => "SUBDOC_MULTI_LOOKUP",
            Opcode::SubdocMultiMutation => "SUBDOC_MULTI_MUTATION",
            Opcode::SubdocGetCount => "SUBDOC_GET_COUNT",
            Opcode::GetErrorMap => "GET_ERROR_MAP",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.code() == value)
            .ok_or(value)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// HELLO feature codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HelloFeature {
    Datatype = 0x01,
    Tls = 0x02,
    TcpNodelay = 0x03,
    MutationSeqno = 0x04,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Collections = 0x09,
    Snappy = 0x0a,
    Json = 0x0b,
    Duplex = 0x0c,
    ClustermapChangeNotification = 0x0d,
    UnorderedExecution = 0x0e,
    Tracing = 0x0f,
}

impl HelloFeature {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x01 => Self::Datatype,
            0x02 => Self::Tls,
            0x03 => Self::TcpNodelay,
            0x04 => Self::MutationSeqno,
            0x06 => Self::Xattr,
            0x07 => Self::Xerror,
            0x08 => Self::SelectBucket,
            0x09 => Self::Collections,
            0x0a => Self::Snappy,
            0x0b => Self::Json,
            0x0c => Self::Duplex,
            0x0d => Self::ClustermapChangeNotification,
            0x0e => Self::UnorderedExecution,
            0x0f => Self::Tracing,
            _ => return None,
        })
    }

    pub const fn code(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(op.code()), Ok(op));
        }
        assert_eq!(Opcode::try_from(0x42u8), Err(0x42));
    }

    #[test]
    fn test_quiet_opcodes() {
        assert!(Opcode::SetQ.is_quiet());
        assert_eq!(Opcode::SetQ.to_non_quiet(), Opcode::Set);
        assert!(Opcode::GatQ.is_quiet_get());
        assert!(!Opcode::DeleteQ.is_quiet_get());
        assert!(!Opcode::Get.is_quiet());
        assert_eq!(Opcode::Get.to_non_quiet(), Opcode::Get);
    }

    #[test]
    fn test_pre_auth_opcodes() {
        assert!(Opcode::Hello.allowed_before_auth());
        assert!(Opcode::GetErrorMap.allowed_before_auth());
        assert!(!Opcode::Get.allowed_before_auth());
        assert!(!Opcode::SelectBucket.allowed_before_auth());
    }

    #[test]
    fn test_hello_features() {
        assert_eq!(HelloFeature::from_code(0x0f), Some(HelloFeature::Tracing));
        assert_eq!(HelloFeature::from_code(0x05), None);
        assert_eq!(HelloFeature::Snappy.code(), 10);
    }
}
