//! Sub-document engine.
//!
//! Path-addressed reads and mutations over a JSON document body or its
//! extended attributes.
//!
//! ```text
//!   path text ──► Path ──► Match (walk from root) ──► Executor ──► SubdocResult
//!                                                        │
//!                                   operand fragment ────┘
//! ```
//!
//! # Modules
//!
//! - [`path`] - Path expression parsing
//! - [`matcher`] - Walking a path through a document
//! - [`operation`] - Operation kinds and request flags
//! - [`executor`] - Applying one operation

pub mod executor;
pub mod matcher;
pub mod operation;
pub mod path;

pub use executor::{execute, SubdocResult};
pub use operation::Operation;
pub use path::{Component, Path};

use thiserror::Error;

use crate::core::error::ErrorCode;

/// Failure evaluating a sub-document operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubdocError {
    #[error("path not found")]
    PathNotFound,
    #[error("path already exists")]
    PathExists,
    #[error("path does not match document structure")]
    PathMismatch,
    #[error("malformed path")]
    PathInvalid,
    #[error("path too deep")]
    PathTooBig,
    #[error("document is not JSON")]
    DocNotJson,
    #[error("existing number out of range")]
    NumberTooBig,
    #[error("bad or out of range delta")]
    DeltaRange,
    #[error("value cannot be inserted")]
    CannotInsert,
}

impl SubdocError {
    pub fn code(self) -> ErrorCode {
        match self {
            Self::PathNotFound => ErrorCode::SubdocPathEnoent,
            Self::PathExists => ErrorCode::SubdocPathEexists,
            Self::PathMismatch => ErrorCode::SubdocPathMismatch,
            Self::PathInvalid => ErrorCode::SubdocPathEinval,
            Self::PathTooBig => ErrorCode::SubdocPathE2big,
            Self::DocNotJson => ErrorCode::SubdocDocNotJson,
            Self::NumberTooBig => ErrorCode::SubdocNumErange,
            Self::DeltaRange => ErrorCode::SubdocDeltaErange,
            Self::CannotInsert => ErrorCode::SubdocValueCantinsert,
        }
    }
}

impl From<SubdocError> for ErrorCode {
    fn from(err: SubdocError) -> Self {
        err.code()
    }
}
