//! Error types and wire status mapping.
//!
//! Two layers of failure exist. [`MockError`] covers conditions that end a
//! connection or fail a control request (framing violations, I/O, unknown
//! buckets).
//! [`ErrorCode`] is the closed set of wire statuses returned to clients in a
//! normal response; the store, sub-document engine and dispatch layer all
//! speak it directly.

use thiserror::Error;

/// Fatal or out-of-band error conditions.
#[derive(Debug, Error)]
pub enum MockError {
    /// Client violated binary framing. The connection is closed.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Socket level failure.
    #[error("io error: {message}")]
    Io { message: String },

    /// Malformed or unknown control channel request.
    #[error("control error: {message}")]
    Control { message: String },

    /// Store was asked for something it cannot provide (unknown bucket, node index).
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl MockError {
    /// Create a Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a Control error.
    pub fn control(message: impl Into<String>) -> Self {
        Self::Control {
            message: message.into(),
        }
    }

    /// Create a Storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Check if this error must terminate the client connection.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Io { .. })
    }
}

impl From<std::io::Error> for MockError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Result type using MockError.
pub type MockResult<T> = Result<T, MockError>;

// ============================================================================
// Wire status codes
// ============================================================================

/// Binary protocol status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0x0000,
    KeyEnoent = 0x0001,
    KeyEexists = 0x0002,
    E2big = 0x0003,
    Einval = 0x0004,
    NotStored = 0x0005,
    DeltaBadval = 0x0006,
    NotMyVbucket = 0x0007,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    UnknownCommand = 0x0081,
    Enomem = 0x0082,
    NotSupported = 0x0083,
    Einternal = 0x0084,
    Ebusy = 0x0085,
    Etmpfail = 0x0086,

    SubdocPathEnoent = 0x00c0,
    SubdocPathMismatch = 0x00c1,
    SubdocPathEinval = 0x00c2,
    SubdocPathE2big = 0x00c3,
    SubdocDocE2deep = 0x00c4,
    SubdocValueCantinsert = 0x00c5,
    SubdocDocNotJson = 0x00c6,
    SubdocNumErange = 0x00c7,
    SubdocDeltaErange = 0x00c8,
    SubdocPathEexists = 0x00c9,
    SubdocValueEtoodeep = 0x00ca,
    SubdocInvalidCombo = 0x00cb,
    SubdocMultiPathFailure = 0x00cc,

    /// Retried by clients with a constant backoff.
    DummyRetryConstant = 0x7ff0,
    /// Retried by clients with a linear backoff.
    DummyRetryLinear = 0x7ff1,
    /// Retried by clients with an exponential backoff.
    DummyRetryExponential = 0x7ff2,
}

impl ErrorCode {
    const ALL: [ErrorCode; 32] = [
        Self::Success,
        Self::KeyEnoent,
        Self::KeyEexists,
        Self::E2big,
        Self::Einval,
        Self::NotStored,
        Self::DeltaBadval,
        Self::NotMyVbucket,
        Self::AuthError,
        Self::AuthContinue,
        Self::UnknownCommand,
        Self::Enomem,
        Self::NotSupported,
        Self::Einternal,
        Self::Ebusy,
        Self::Etmpfail,
        Self::SubdocPathEnoent,
        Self::SubdocPathMismatch,
        Self::SubdocPathEinval,
        Self::SubdocPathE2big,
        Self::SubdocDocE2deep,
        Self::SubdocValueCantinsert,
        Self::SubdocDocNotJson,
        Self::SubdocNumErange,
        Self::SubdocDeltaErange,
        Self::SubdocPathEexists,
        Self::SubdocValueEtoodeep,
        Self::SubdocInvalidCombo,
        Self::SubdocMultiPathFailure,
        Self::DummyRetryConstant,
        Self::DummyRetryLinear,
        Self::DummyRetryExponential,
    ];

    /// Numeric wire value.
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Upper-case name as it appears in the error map.
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::KeyEnoent => "KEY_ENOENT",
            Self::KeyEexists => "KEY_EEXISTS",
            Self::E2big => "E2BIG",
            Self::Einval => "EINVAL",
            Self::NotStored => "NOT_STORED",
            Self::DeltaBadval => "DELTA_BADVAL",
            Self::NotMyVbucket => "NOT_MY_VBUCKET",
            Self::AuthError => "AUTH_ERROR",
            Self::AuthContinue => "AUTH_CONTINUE",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::Enomem => "ENOMEM",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Einternal => "EINTERNAL",
            Self::Ebusy => "EBUSY",
            Self::Etmpfail => "ETMPFAIL",
            Self::SubdocPathEnoent => "SUBDOC_PATH_ENOENT",
            Self::SubdocPathMismatch => "SUBDOC_PATH_MISMATCH",
            Self::SubdocPathEinval => "SUBDOC_PATH_EINVAL",
            Self::SubdocPathE2big => "SUBDOC_PATH_E2BIG",
            Self::SubdocDocE2deep => "SUBDOC_DOC_E2DEEP",
            Self::SubdocValueCantinsert => "SUBDOC_VALUE_CANTINSERT",
            Self::SubdocDocNotJson => "SUBDOC_DOC_NOTJSON",
            Self::SubdocNumErange => "SUBDOC_NUM_ERANGE",
            Self::SubdocDeltaErange => "SUBDOC_DELTA_ERANGE",
            Self::SubdocPathEexists => "SUBDOC_PATH_EEXISTS",
            Self::SubdocValueEtoodeep => "SUBDOC_VALUE_ETOODEEP",
            Self::SubdocInvalidCombo => "SUBDOC_INVALID_COMBO",
            Self::SubdocMultiPathFailure => "SUBDOC_MULTI_PATH_FAILURE",
            Self::DummyRetryConstant => "DUMMY_RETRY_CONSTANT",
            Self::DummyRetryLinear => "DUMMY_RETRY_LINEAR",
            Self::DummyRetryExponential => "DUMMY_RETRY_EXPONENTIAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:04x})", self.name(), self.code())
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = MockError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.code() == value)
            .ok_or_else(|| MockError::control(format!("unknown status code 0x{:04x}", value)))
    }
}
