//! Stored documents.

use bytes::Bytes;
use serde::Serialize;

use crate::core::time::UnixTime;

/// CAS reported to readers while an item is locked.
pub const LOCKED_CAS: u64 = u64::MAX;

/// Seconds a GETL lock lasts when the request asks for zero or too much.
pub const DEFAULT_LOCK_TIME: u32 = 15;

/// Longest lock a client may request.
pub const MAX_LOCK_TIME: u32 = 29;

/// Datatype bits carried in the header and stored with each item.
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

/// Identity of a stored item. The same key in two vbuckets is two items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeySpec {
    pub key: Bytes,
    pub vbucket: u16,
}

impl KeySpec {
    pub fn new(key: impl Into<Bytes>, vbucket: u16) -> Self {
        Self {
            key: key.into(),
            vbucket,
        }
    }

    /// Key rendered lossily for logs and control replies.
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

impl std::fmt::Display for KeySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@vb{}", self.key_str(), self.vbucket)
    }
}

/// A stored document.
///
/// `expiry` and `lock_expiry` are absolute mock timestamps, zero meaning
/// "none". `cas` is assigned by the store on every successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key_spec: KeySpec,
    pub flags: u32,
    pub expiry: u32,
    pub value: Bytes,
    pub xattr: Option<Bytes>,
    pub cas: u64,
    pub datatype: u8,
    pub lock_expiry: u32,
}

impl Item {
    pub fn new(key_spec: KeySpec, flags: u32, expiry: u32, value: impl Into<Bytes>, cas: u64) -> Self {
        Self {
            key_spec,
            flags,
            expiry,
            value: value.into(),
            xattr: None,
            cas,
            datatype: datatype::RAW,
            lock_expiry: 0,
        }
    }

    /// Empty placeholder used for replicated deletions.
    pub fn tombstone(key_spec: KeySpec) -> Self {
        Self::new(key_spec, 0, 0, Bytes::new(), 0)
    }

    pub fn with_xattr(mut self, xattr: Option<Bytes>) -> Self {
        self.xattr = xattr;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn is_expired(&self, now: UnixTime) -> bool {
        self.expiry != 0 && now.is_at_or_after(self.expiry)
    }

    pub fn is_locked(&self, now: UnixTime) -> bool {
        self.lock_expiry != 0 && now.secs() <= self.lock_expiry
    }

    /// Check the lock against a caller's CAS. A matching CAS releases it.
    pub fn ensure_unlocked(&mut self, cas: u64, now: UnixTime) -> bool {
        if !self.is_locked(now) {
            return true;
        }
        if cas == self.cas {
            self.lock_expiry = 0;
            return true;
        }
        false
    }

    /// CAS as reported to a plain reader.
    pub fn visible_cas(&self, now: UnixTime) -> u64 {
        if self.is_locked(now) {
            LOCKED_CAS
        } else {
            self.cas
        }
    }

    /// Summary used by the `KEYINFO` control command.
    pub fn describe(&self) -> ItemSummary {
        ItemSummary {
            value: String::from_utf8_lossy(&self.value).into_owned(),
            cas: self.cas,
            exp: self.expiry,
            flags: self.flags,
        }
    }
}

/// Externally visible metadata of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemSummary {
    pub value: String,
    #[serde(rename = "CAS")]
    pub cas: u64,
    pub exp: u32,
    pub flags: u32,
}

/// Normalize a requested lock time.
pub fn clamp_lock_time(requested: u32) -> u32 {
    if requested == 0 || requested > MAX_LOCK_TIME {
        DEFAULT_LOCK_TIME
    } else {
        requested
    }
}
