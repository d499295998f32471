//! Sub-document commands.
//!
//! Single-path request body (after the key):
//!
//! ```text
//!   extras: pathlen u16 | pathflags u8 [| expiry u32] [| docflags u8]
//!   value:  path | operand
//! ```
//!
//! Multi-spec request body:
//!
//! ```text
//!   extras: [expiry u32] [| docflags u8]
//!   lookup spec:   op u8 | flags u8 | pathlen u16 | path
//!   mutation spec: op u8 | flags u8 | pathlen u16 | valuelen u32 | path | value
//! ```
//!
//! A mutation batch runs against a working copy of the document and is
//! stored only when every spec succeeded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Context, Failure, HandlerResult, Reply};
use crate::adapters::memcached::{Opcode, Request};
use crate::core::error::ErrorCode;
use crate::storage::{datatype, Access, Item, Mutation, VBucketStore};
use crate::subdoc::operation::{
    DOCFLAG_ACCESS_DELETED, DOCFLAG_ADD, DOCFLAG_CREATEMASK, DOCFLAG_MKDOC, PATHFLAG_EXPAND_MACROS,
    PATHFLAG_MKDIR_P, PATHFLAG_XATTR,
};
use crate::subdoc::{self, Operation, SubdocError, SubdocResult};

const KNOWN_PATH_FLAGS: u8 = PATHFLAG_MKDIR_P | PATHFLAG_XATTR | PATHFLAG_EXPAND_MACROS;
const KNOWN_DOC_FLAGS: u8 = DOCFLAG_MKDOC | DOCFLAG_ADD | DOCFLAG_ACCESS_DELETED;
const EMPTY_XATTR: &[u8] = b"{}";

/// Most specs a multi-path request may carry.
pub const MAX_SPECS: usize = 16;

// ============================================================================
// Decoding
// ============================================================================

/// A single-path sub-document request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocRequest {
    pub op: Operation,
    pub path: String,
    pub path_flags: u8,
    pub doc_flags: u8,
    /// Wire expiry, when the request carried one.
    pub expiry: Option<u32>,
    pub value: Bytes,
}

impl SubdocRequest {
    pub fn decode(opcode: Opcode, request: &Request) -> Result<Self, Failure> {
        let op = Operation::from_opcode(opcode.code()).ok_or(ErrorCode::UnknownCommand)?;
        let mut extras = request.extras.clone();
        let (path_len, path_flags, expiry, doc_flags) = match extras.len() {
            3 => (extras.get_u16(), extras.get_u8(), None, 0),
            4 => (extras.get_u16(), extras.get_u8(), None, extras.get_u8()),
            7 => (extras.get_u16(), extras.get_u8(), Some(extras.get_u32()), 0),
            8 => {
                let path_len = extras.get_u16();
                let path_flags = extras.get_u8();
                let expiry = extras.get_u32();
                (path_len, path_flags, Some(expiry), extras.get_u8())
            }
            n => {
                return Err(Failure::new(ErrorCode::Einval)
                    .with_context(format!("sub-document extras must be 3, 4, 7 or 8 bytes, got {}", n)))
            }
        };

        let path_len = path_len as usize;
        if request.value.len() < path_len {
            return Err(Failure::new(ErrorCode::Einval).with_context("path exceeds body"));
        }
        let mut body = request.value.clone();
        let path = utf8(body.split_to(path_len))?;

        let req = Self {
            op,
            path,
            path_flags,
            doc_flags,
            expiry,
            value: body,
        };
        req.validate()?;
        Ok(req)
    }

    fn validate(&self) -> Result<(), Failure> {
        validate_flags(self.op, self.path_flags)?;
        if self.doc_flags & !KNOWN_DOC_FLAGS != 0 {
            return Err(Failure::new(ErrorCode::Einval).with_context("unknown document flags"));
        }
        if self.doc_flags & DOCFLAG_CREATEMASK == DOCFLAG_CREATEMASK {
            return Err(Failure::new(ErrorCode::Einval).with_context("mkdoc and add are exclusive"));
        }
        if self.doc_flags & DOCFLAG_CREATEMASK != 0 && !self.op.is_creative() {
            return Err(Failure::new(ErrorCode::Einval).with_context("operation cannot create a document"));
        }
        if self.op.is_lookup() && (!self.value.is_empty() || self.expiry.is_some()) {
            return Err(Failure::new(ErrorCode::Einval).with_context("lookups take no value or expiry"));
        }
        Ok(())
    }

    fn is_xattr(&self) -> bool {
        self.path_flags & PATHFLAG_XATTR != 0
    }
}

/// One spec of a multi-path request. `opcode` stays raw so unknown
/// operations can be reported per spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiSpec {
    pub opcode: u8,
    pub flags: u8,
    pub path: String,
    pub value: Bytes,
}

impl MultiSpec {
    fn operation(&self) -> Option<Operation> {
        Operation::from_opcode(self.opcode)
    }
}

/// A multi-lookup or multi-mutation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiRequest {
    pub mutation: bool,
    pub doc_flags: u8,
    pub expiry: Option<u32>,
    pub specs: Vec<MultiSpec>,
}

impl MultiRequest {
    pub fn decode(opcode: Opcode, request: &Request) -> Result<Self, Failure> {
        let mutation = opcode == Opcode::SubdocMultiMutation;
        let mut extras = request.extras.clone();
        let (expiry, doc_flags) = match extras.len() {
            0 => (None, 0),
            1 => (None, extras.get_u8()),
            4 => (Some(extras.get_u32()), 0),
            5 => {
                let expiry = extras.get_u32();
                (Some(expiry), extras.get_u8())
            }
            n => {
                return Err(Failure::new(ErrorCode::Einval)
                    .with_context(format!("multi-path extras must be 0, 1, 4 or 5 bytes, got {}", n)))
            }
        };
        if doc_flags & !KNOWN_DOC_FLAGS != 0 || doc_flags & DOCFLAG_CREATEMASK == DOCFLAG_CREATEMASK {
            return Err(Failure::new(ErrorCode::Einval).with_context("invalid document flags"));
        }
        if !mutation && (expiry.is_some() || doc_flags & DOCFLAG_CREATEMASK != 0) {
            return Err(Failure::new(ErrorCode::Einval).with_context("lookups take no expiry or create flags"));
        }

        let specs = decode_specs(request.value.clone(), mutation)?;
        if specs.is_empty() {
            return Err(Failure::new(ErrorCode::Einval).with_context("no specs"));
        }
        if specs.len() > MAX_SPECS {
            return Err(Failure::new(ErrorCode::SubdocInvalidCombo)
                .with_context(format!("{} specs, at most {} allowed", specs.len(), MAX_SPECS)));
        }
        Ok(Self {
            mutation,
            doc_flags,
            expiry,
            specs,
        })
    }

    /// Root container for a missing document, from the first spec that has one.
    fn root_type(&self) -> Option<&'static str> {
        self.specs
            .iter()
            .filter_map(|s| s.operation().and_then(|op| op.root_type(&s.path)))
            .next()
    }
}

fn decode_specs(mut body: Bytes, mutation: bool) -> Result<Vec<MultiSpec>, Failure> {
    let truncated = || Failure::new(ErrorCode::Einval).with_context("truncated spec");
    let header_len = if mutation { 8 } else { 4 };
    let mut specs = Vec::new();
    while body.has_remaining() {
        if body.remaining() < header_len {
            return Err(truncated());
        }
        let opcode = body.get_u8();
        let flags = body.get_u8();
        let path_len = body.get_u16() as usize;
        let value_len = if mutation { body.get_u32() as usize } else { 0 };
        if body.remaining() < path_len + value_len {
            return Err(truncated());
        }
        let path = utf8(body.split_to(path_len))?;
        let value = body.split_to(value_len);
        specs.push(MultiSpec {
            opcode,
            flags,
            path,
            value,
        });
    }
    Ok(specs)
}

fn utf8(bytes: Bytes) -> Result<String, Failure> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Failure::new(ErrorCode::SubdocPathEinval).with_context("path is not UTF-8"))
}

fn validate_flags(op: Operation, flags: u8) -> Result<(), Failure> {
    if flags & !KNOWN_PATH_FLAGS != 0 {
        return Err(Failure::new(ErrorCode::Einval).with_context("unknown path flags"));
    }
    if flags & PATHFLAG_MKDIR_P != 0 && !op.is_creative() {
        return Err(Failure::new(ErrorCode::Einval).with_context("mkdir_p on a non-creating operation"));
    }
    if flags & PATHFLAG_EXPAND_MACROS != 0 && flags & PATHFLAG_XATTR == 0 {
        return Err(Failure::new(ErrorCode::Einval).with_context("macros are only expanded in xattrs"));
    }
    Ok(())
}

// ============================================================================
// Working document
// ============================================================================

/// The document a request operates on, loaded or synthesized.
struct Working {
    base: Item,
    body: Bytes,
    xattr: Bytes,
    xattr_touched: bool,
    create: bool,
}

impl Working {
    fn load(item: Item) -> Self {
        let xattr = item.xattr.clone().unwrap_or_else(|| Bytes::from_static(EMPTY_XATTR));
        Self {
            body: item.value.clone(),
            xattr,
            xattr_touched: false,
            create: false,
            base: item,
        }
    }

    /// Fresh document for a create. A single xattr path puts the root in
    /// the xattr and leaves the body empty; otherwise the body gets the root.
    fn synthesize(ctx: &Context<'_>, root: &'static str, xattr_root: bool) -> Self {
        let base = Item::new(ctx.key_spec(), 0, 0, Bytes::new(), 0).with_datatype(datatype::JSON);
        let (body, xattr) = if xattr_root {
            (Bytes::new(), Bytes::from_static(root.as_bytes()))
        } else {
            (Bytes::from_static(root.as_bytes()), Bytes::from_static(EMPTY_XATTR))
        };
        Self {
            base,
            body,
            xattr,
            xattr_touched: false,
            create: true,
        }
    }

    fn target(&self, xattr: bool) -> &[u8] {
        if xattr {
            &self.xattr
        } else {
            &self.body
        }
    }

    fn apply(
        &mut self,
        op: Operation,
        path: &str,
        value: &[u8],
        flags: u8,
        mkdir_p: bool,
    ) -> Result<SubdocResult, SubdocError> {
        let xattr = flags & PATHFLAG_XATTR != 0;
        let operand = if op.requires_value() { Some(value) } else { None };
        let result = subdoc::execute(self.target(xattr), path, op, operand, mkdir_p)?;
        if result.document.is_some() {
            let doc = Bytes::from(result.document_bytes());
            if xattr {
                self.xattr = doc;
                self.xattr_touched = true;
            } else {
                self.body = doc;
            }
        }
        Ok(result)
    }

    /// Persist the working copy. `cas` is the caller's CAS, if any.
    fn commit(
        self,
        ctx: &Context<'_>,
        cache: &VBucketStore,
        expiry: Option<u32>,
        cas: u64,
    ) -> Result<Mutation, ErrorCode> {
        let expiry = expiry.map(|e| ctx.expiry(e)).unwrap_or(self.base.expiry);
        let xattr = if self.xattr_touched {
            Some(self.xattr)
        } else {
            self.base.xattr.clone()
        };
        let size = self.body.len() + xattr.as_ref().map_or(0, Bytes::len);
        let limit = ctx.node.settings().max_value_size();
        if size > limit {
            tracing::debug!(key = %self.base.key_spec, size, limit, "subdoc result too big");
            return Err(ErrorCode::E2big);
        }
        let mut dt = self.base.datatype & !datatype::XATTR;
        if xattr.is_some() {
            dt |= datatype::XATTR;
        }
        let item = Item::new(self.base.key_spec.clone(), self.base.flags, expiry, self.body, cas)
            .with_xattr(xattr)
            .with_datatype(dt);
        let applied = if self.create {
            cache.add(item)
        } else {
            cache.replace(item)
        };
        ctx.storage().apply(applied)
    }
}

/// Outcome of loading the document for a request.
enum Loaded {
    Ready(Working),
    Missing,
}

fn load(
    ctx: &Context<'_>,
    cache: &VBucketStore,
    doc_flags: u8,
    root: impl FnOnce() -> Option<&'static str>,
    xattr_root: bool,
    mutating: bool,
) -> Result<Loaded, Failure> {
    let existing = ctx.storage().apply(cache.get(&ctx.key_spec()));
    match existing {
        Some(item) => {
            if doc_flags & DOCFLAG_ADD != 0 {
                return Err(Failure::new(ErrorCode::KeyEexists));
            }
            if mutating && item.is_locked(cache.now()) && ctx.request.header.cas != item.cas {
                return Err(Failure::new(ErrorCode::Etmpfail));
            }
            Ok(Loaded::Ready(Working::load(item)))
        }
        None if doc_flags & DOCFLAG_CREATEMASK == 0 => Ok(Loaded::Missing),
        None if ctx.request.header.cas != 0 => Ok(Loaded::Missing),
        None => match root() {
            Some(root) => Ok(Loaded::Ready(Working::synthesize(ctx, root, xattr_root))),
            None => Ok(Loaded::Missing),
        },
    }
}

/// CAS the replace must match: the caller's, else the loaded one.
fn effective_cas(ctx: &Context<'_>, working: &Working) -> u64 {
    match ctx.request.header.cas {
        0 if working.create => 0,
        0 => working.base.cas,
        cas => cas,
    }
}

// ============================================================================
// Single path
// ============================================================================

pub fn single(ctx: &Context<'_>, req: &SubdocRequest) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    loop {
        let root = || req.op.root_type(&req.path);
        let mut working = match load(ctx, cache, req.doc_flags, root, req.is_xattr(), req.op.is_mutator())? {
            Loaded::Ready(working) => working,
            Loaded::Missing => return Err(Failure::new(ErrorCode::KeyEnoent)),
        };

        let mkdir_p = req.path_flags & PATHFLAG_MKDIR_P != 0 || working.create;
        let result = working.apply(req.op, &req.path, &req.value, req.path_flags, mkdir_p)?;
        let matched = if req.op.returns_match() {
            Bytes::from(result.match_bytes())
        } else {
            Bytes::new()
        };

        if req.op.is_lookup() {
            let cas = working.base.visible_cas(cache.now());
            let response = ctx.response().with_cas(cas).with_value(matched);
            let response = if response.value.is_empty() {
                response
            } else {
                response.with_datatype(datatype::JSON)
            };
            return Ok(Reply::One(response));
        }

        let created = working.create;
        let cas = effective_cas(ctx, &working);
        match working.commit(ctx, cache, req.expiry, cas) {
            Ok(mutation) => {
                let response = ctx.mutation_response(&mutation).with_value(matched);
                return Ok(Reply::One(response));
            }
            // someone created the document first, start over against it
            Err(ErrorCode::KeyEexists) if created => continue,
            Err(code) => return Err(code.into()),
        }
    }
}

// ============================================================================
// Multi path
// ============================================================================

pub fn multi(ctx: &Context<'_>, req: &MultiRequest) -> HandlerResult {
    if req.mutation {
        multi_mutation(ctx, req)
    } else {
        multi_lookup(ctx, req)
    }
}

fn multi_lookup(ctx: &Context<'_>, req: &MultiRequest) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    let mut working = match load(ctx, cache, 0, || None, false, false)? {
        Loaded::Ready(working) => working,
        Loaded::Missing => return Err(Failure::new(ErrorCode::KeyEnoent)),
    };

    let mut body = BytesMut::new();
    let mut failed = false;
    for spec in &req.specs {
        let (status, value) = match spec.operation() {
            None => (ErrorCode::UnknownCommand, Vec::new()),
            Some(op) if !op.is_lookup() => return Err(Failure::new(ErrorCode::SubdocInvalidCombo)),
            Some(op) => {
                if let Err(failure) = validate_flags(op, spec.flags) {
                    return Err(failure);
                }
                match working.apply(op, &spec.path, &[], spec.flags, false) {
                    Ok(result) if op.returns_match() => (ErrorCode::Success, result.match_bytes()),
                    Ok(_) => (ErrorCode::Success, Vec::new()),
                    Err(SubdocError::DocNotJson) => return Err(SubdocError::DocNotJson.into()),
                    Err(err) => (err.code(), Vec::new()),
                }
            }
        };
        failed |= !status.is_success();
        body.put_u16(status.code());
        body.put_u32(value.len() as u32);
        body.put_slice(&value);
    }

    let status = if failed {
        ErrorCode::SubdocMultiPathFailure
    } else {
        ErrorCode::Success
    };
    let cas = working.base.visible_cas(cache.now());
    Ok(Reply::One(
        ctx.response().with_status(status).with_cas(cas).with_value(body.freeze()),
    ))
}

fn multi_mutation(ctx: &Context<'_>, req: &MultiRequest) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    loop {
        // later specs may address the body, so it always gets the root
        let mut working = match load(ctx, cache, req.doc_flags, || req.root_type(), false, true)? {
            Loaded::Ready(working) => working,
            Loaded::Missing => return Err(Failure::new(ErrorCode::KeyEnoent)),
        };

        let mut results = BytesMut::new();
        for (index, spec) in req.specs.iter().enumerate() {
            let op = match spec.operation() {
                Some(op) if op.is_lookup() => return Ok(spec_failure(ctx, index, ErrorCode::SubdocInvalidCombo)),
                Some(op) => op,
                None => return Ok(spec_failure(ctx, index, ErrorCode::UnknownCommand)),
            };
            if let Err(failure) = validate_flags(op, spec.flags) {
                return Ok(spec_failure(ctx, index, failure.code));
            }
            let mkdir_p = spec.flags & PATHFLAG_MKDIR_P != 0 || req.doc_flags & DOCFLAG_CREATEMASK != 0;
            match working.apply(op, &spec.path, &spec.value, spec.flags, mkdir_p) {
                Ok(result) if op.returns_match() => {
                    let value = result.match_bytes();
                    results.put_u8(index as u8);
                    results.put_u16(ErrorCode::Success.code());
                    results.put_u32(value.len() as u32);
                    results.put_slice(&value);
                }
                Ok(_) => {}
                Err(err) => return Ok(spec_failure(ctx, index, err.code())),
            }
        }

        let created = working.create;
        let cas = effective_cas(ctx, &working);
        match working.commit(ctx, cache, req.expiry, cas) {
            Ok(mutation) => {
                return Ok(Reply::One(
                    ctx.mutation_response(&mutation).with_value(results.freeze()),
                ))
            }
            Err(ErrorCode::KeyEexists) if created => continue,
            Err(code) => return Err(code.into()),
        }
    }
}

/// Batch aborted at `index`. Invalid combinations surface as the top-level
/// status; everything else is wrapped in a multi-path failure.
fn spec_failure(ctx: &Context<'_>, index: usize, code: ErrorCode) -> Reply {
    let status = if code == ErrorCode::SubdocInvalidCombo {
        code
    } else {
        ErrorCode::SubdocMultiPathFailure
    };
    let mut body = BytesMut::with_capacity(3);
    body.put_u8(index as u8);
    body.put_u16(code.code());
    Reply::One(ctx.response().with_status(status).with_value(body.freeze()))
}
