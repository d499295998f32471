//! Sub-document operation kinds and their properties.

/// Path flag: create missing intermediate dictionaries.
pub const PATHFLAG_MKDIR_P: u8 = 0x01;
/// Path flag: address the extended attributes instead of the body.
pub const PATHFLAG_XATTR: u8 = 0x04;
/// Path flag: expand server macros in the value.
pub const PATHFLAG_EXPAND_MACROS: u8 = 0x10;

/// Doc flag: create the document if it does not exist.
pub const DOCFLAG_MKDOC: u8 = 0x01;
/// Doc flag: create the document, failing if it exists.
pub const DOCFLAG_ADD: u8 = 0x02;
pub const DOCFLAG_CREATEMASK: u8 = DOCFLAG_MKDOC | DOCFLAG_ADD;
/// Doc flag: operate on a deleted document.
pub const DOCFLAG_ACCESS_DELETED: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Exists,
    GetCount,
    DictAdd,
    DictUpsert,
    Remove,
    Replace,
    ArrayPrepend,
    ArrayAppend,
    ArrayInsert,
    AddUnique,
    Counter,
}

impl Operation {
    /// Operation carried by a sub-document opcode, if any.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Some(match opcode {
            0xc5 => Self::Get,
            0xc6 => Self::Exists,
            0xc7 => Self::DictAdd,
            0xc8 => Self::DictUpsert,
            0xc9 => Self::Remove,
            0xca => Self::Replace,
            0xcb => Self::ArrayAppend,
            0xcc => Self::ArrayPrepend,
            0xcd => Self::ArrayInsert,
            0xce => Self::AddUnique,
            0xcf => Self::Counter,
            0xd2 => Self::GetCount,
            _ => return None,
        })
    }

    pub fn requires_value(self) -> bool {
        !matches!(self, Self::Get | Self::Exists | Self::Remove | Self::GetCount)
    }

    /// A comma separated list of values is accepted.
    pub fn allows_multi_value(self) -> bool {
        matches!(self, Self::ArrayAppend | Self::ArrayPrepend | Self::ArrayInsert)
    }

    pub fn is_mutator(self) -> bool {
        !self.is_lookup()
    }

    pub fn is_lookup(self) -> bool {
        matches!(self, Self::Get | Self::Exists | Self::GetCount)
    }

    /// The response carries the matched (or computed) value.
    pub fn returns_match(self) -> bool {
        matches!(self, Self::Get | Self::GetCount | Self::Counter)
    }

    /// The value is parsed as array elements.
    pub fn is_array_parent(self) -> bool {
        matches!(
            self,
            Self::ArrayInsert | Self::ArrayPrepend | Self::ArrayAppend | Self::AddUnique
        )
    }

    /// Can bring a new value into existence.
    pub fn is_creative(self) -> bool {
        self.is_mutator() && !matches!(self, Self::Replace | Self::Remove)
    }

    /// Root container to synthesize when creating a missing document.
    pub fn root_type(self, path: &str) -> Option<&'static str> {
        if path.is_empty() {
            return match self {
                Self::ArrayAppend | Self::ArrayPrepend | Self::AddUnique => Some("[]"),
                _ => None,
            };
        }
        if path.starts_with('[') {
            Some("[]")
        } else {
            Some("{}")
        }
    }
}
