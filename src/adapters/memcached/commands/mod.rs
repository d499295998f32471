//! Command decoding and dispatch.
//!
//! A decoded [`Request`] becomes one [`Command`] variant, and each variant is
//! handled by a plain function over the command, the serving node and the
//! connection's [`Session`]. Handlers return a [`Reply`] or a [`Failure`];
//! the [`Dispatcher`] turns either into wire responses.
//!
//! ```text
//!   Request ──► inactive? ──► datatype ──► cmdlog ──► failmaker ──► auth
//!                                                                   │
//!        Outcome ◄── quiet filter ◄── tracing ◄── handler ◄── Command::decode
//! ```
//!
//! Handler groups:
//!
//! - [`storage`] - set, add, replace, append, prepend, delete
//! - [`retrieval`] - get and its variants, touch, lock, unlock, random key
//! - [`arithmetic`] - incr, decr
//! - [`observe`] - observe, observe-seqno
//! - [`subdoc`] - single path and multi-spec sub-document commands
//! - [`other`] - connection control, auth, stats, config, error map

pub mod arithmetic;
pub mod observe;
pub mod other;
pub mod retrieval;
pub mod storage;
pub mod subdoc;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use nanoid::nanoid;
use serde_json::{json, Map, Value};

use super::protocol::{Request, Response};
use super::{HelloFeature, Opcode};
use crate::control::cluster::{Bucket, Node};
use crate::core::config::{BucketType, CompressionMode};
use crate::core::error::{ErrorCode, MockError, MockResult};
use crate::core::time::convert_expiry;
use crate::storage::{datatype, Access, Item, KeySpec, Mutation, Storage, VBucketStore};
use crate::subdoc::SubdocError;

pub use subdoc::{MultiRequest, MultiSpec, SubdocRequest};

// ============================================================================
// Commands
// ============================================================================

/// How a store command treats an existing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
}

/// A fully decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get,
    GetReplica,
    GetLocked { lock_time: u32 },
    Touch { expiry: u32 },
    GetAndTouch { expiry: u32 },
    Unlock,
    GetRandomKey,
    Store { mode: StoreMode, flags: u32, expiry: u32 },
    Concat { prepend: bool },
    Delete,
    Arithmetic { increment: bool, delta: u64, initial: u64, expiry: u32 },
    Observe { keys: Vec<KeySpec> },
    ObserveSeqno { uuid: u64 },
    Noop,
    Version,
    Verbosity,
    Quit,
    Flush,
    Stat { group: String },
    Hello { agent: String, features: Vec<u16> },
    SaslListMechs,
    SaslAuth { mechanism: String, payload: Bytes },
    SaslStep,
    GetErrorMap { version: u16 },
    GetClusterConfig,
    SelectBucket { name: String },
    Subdoc(SubdocRequest),
    SubdocMulti(MultiRequest),
}

impl Command {
    /// Decode the body of `request` for `opcode`.
    pub fn decode(opcode: Opcode, request: &Request) -> Result<Self, Failure> {
        use Opcode::*;

        let command = match opcode {
            Get | GetQ | GetK | GetKQ => {
                require_key(request)?;
                require_extras(request, &[0])?;
                Command::Get
            }
            GetReplica => {
                require_key(request)?;
                Command::GetReplica
            }
            GetLocked => {
                require_key(request)?;
                require_extras(request, &[0, 4])?;
                let lock_time = if request.extras.is_empty() {
                    0
                } else {
                    request.extras.clone().get_u32()
                };
                Command::GetLocked { lock_time }
            }
            Touch | Gat | GatQ => {
                require_key(request)?;
                require_extras(request, &[4])?;
                let expiry = request.extras.clone().get_u32();
                if opcode == Touch {
                    Command::Touch { expiry }
                } else {
                    Command::GetAndTouch { expiry }
                }
            }
            UnlockKey => {
                require_key(request)?;
                Command::Unlock
            }
            GetRandomKey => Command::GetRandomKey,
            Set | SetQ | Add | AddQ | Replace | ReplaceQ => {
                require_key(request)?;
                require_extras(request, &[8])?;
                let mut extras = request.extras.clone();
                let flags = extras.get_u32();
                let expiry = extras.get_u32();
                let mode = match opcode.to_non_quiet() {
                    Add => StoreMode::Add,
                    Replace => StoreMode::Replace,
                    _ => StoreMode::Set,
                };
                Command::Store { mode, flags, expiry }
            }
            Append | AppendQ | Prepend | PrependQ => {
                require_key(request)?;
                require_extras(request, &[0])?;
                Command::Concat {
                    prepend: opcode.to_non_quiet() == Prepend,
                }
            }
            Delete | DeleteQ => {
                require_key(request)?;
                require_extras(request, &[0])?;
                Command::Delete
            }
            Increment | IncrementQ | Decrement | DecrementQ => {
                require_key(request)?;
                require_extras(request, &[20])?;
                let mut extras = request.extras.clone();
                Command::Arithmetic {
                    increment: opcode.to_non_quiet() == Increment,
                    delta: extras.get_u64(),
                    initial: extras.get_u64(),
                    expiry: extras.get_u32(),
                }
            }
            Observe => Command::Observe {
                keys: decode_observe_keys(&request.value)?,
            },
            ObserveSeqno => {
                if request.value.len() != 8 {
                    return Err(Failure::new(ErrorCode::Einval).with_context("expected 8 byte uuid"));
                }
                Command::ObserveSeqno {
                    uuid: request.value.clone().get_u64(),
                }
            }
            Noop => Command::Noop,
            Version => Command::Version,
            Verbosity => Command::Verbosity,
            Quit | QuitQ => Command::Quit,
            Flush | FlushQ => Command::Flush,
            Stat => Command::Stat {
                group: request.key_str(),
            },
            Hello => {
                if request.value.len() % 2 != 0 {
                    return Err(Failure::new(ErrorCode::Einval).with_context("odd feature list"));
                }
                let features = request
                    .value
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Command::Hello {
                    agent: request.key_str(),
                    features,
                }
            }
            SaslListMechs => Command::SaslListMechs,
            SaslAuth => Command::SaslAuth {
                mechanism: request.key_str(),
                payload: request.value.clone(),
            },
            SaslStep => Command::SaslStep,
            GetErrorMap => {
                if request.value.len() != 2 {
                    return Err(Failure::new(ErrorCode::Einval).with_context("expected 2 byte version"));
                }
                Command::GetErrorMap {
                    version: request.value.clone().get_u16(),
                }
            }
            GetClusterConfig => Command::GetClusterConfig,
            SelectBucket => {
                require_key(request)?;
                Command::SelectBucket {
                    name: request.key_str(),
                }
            }
            SubdocMultiLookup | SubdocMultiMutation => {
                require_key(request)?;
                Command::SubdocMulti(MultiRequest::decode(opcode, request)?)
            }
            SubdocGet | SubdocExists | SubdocDictAdd | SubdocDictUpsert | SubdocDelete
            | SubdocReplace | SubdocArrayPushLast | SubdocArrayPushFirst | SubdocArrayInsert
            | SubdocArrayAddUnique | SubdocCounter | SubdocGetCount => {
                require_key(request)?;
                Command::Subdoc(SubdocRequest::decode(opcode, request)?)
            }
        };
        Ok(command)
    }

    /// Commands that only make sense for vbucket-aware buckets.
    pub fn requires_vbuckets(&self) -> bool {
        matches!(
            self,
            Command::GetReplica
                | Command::GetLocked { .. }
                | Command::Unlock
                | Command::Observe { .. }
                | Command::ObserveSeqno { .. }
                | Command::GetClusterConfig
                | Command::GetRandomKey
        )
    }
}

fn require_key(request: &Request) -> Result<(), Failure> {
    if request.key.is_empty() {
        return Err(Failure::new(ErrorCode::Einval).with_context("key is required"));
    }
    Ok(())
}

fn require_extras(request: &Request, allowed: &[usize]) -> Result<(), Failure> {
    if !allowed.contains(&request.extras.len()) {
        return Err(Failure::new(ErrorCode::Einval)
            .with_context(format!("invalid extras length {}", request.extras.len())));
    }
    Ok(())
}

fn decode_observe_keys(value: &Bytes) -> Result<Vec<KeySpec>, Failure> {
    let mut buf = value.clone();
    let mut keys = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(Failure::new(ErrorCode::Einval).with_context("truncated observe entry"));
        }
        let vbucket = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(Failure::new(ErrorCode::Einval).with_context("truncated observe key"));
        }
        keys.push(KeySpec::new(buf.split_to(len), vbucket));
    }
    Ok(keys)
}

// ============================================================================
// Handler results
// ============================================================================

/// Error outcome of a handler, answered with a bodiless status response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: ErrorCode,
    /// Human readable detail for the extended error body.
    pub context: Option<String>,
}

impl Failure {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, context: None }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<ErrorCode> for Failure {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl From<SubdocError> for Failure {
    fn from(err: SubdocError) -> Self {
        Self::new(err.code())
    }
}

/// What a handler wants written back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    One(Response),
    /// Several responses for one request, sent as is.
    Many(Vec<Response>),
    /// Nothing at all.
    Silent,
    /// Optionally answer, then close the connection.
    Close(Option<Response>),
}

pub type HandlerResult = Result<Reply, Failure>;

/// Responses for one request and whether to hang up afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub responses: Vec<Response>,
    pub close: bool,
}

impl Outcome {
    fn silent() -> Self {
        Self::default()
    }

    fn one(response: Response) -> Self {
        Self {
            responses: vec![response],
            close: false,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Features negotiated through HELLO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub mutation_seqno: bool,
    pub xattr: bool,
    pub xerror: bool,
    pub select_bucket: bool,
    pub snappy: bool,
    pub tracing: bool,
}

impl Features {
    /// Enable `feature` if the server supports it. Returns whether it did.
    pub fn enable(&mut self, feature: HelloFeature, compression: CompressionMode) -> bool {
        let slot = match feature {
            HelloFeature::MutationSeqno => &mut self.mutation_seqno,
            HelloFeature::Xattr => &mut self.xattr,
            HelloFeature::Xerror => &mut self.xerror,
            HelloFeature::SelectBucket => &mut self.select_bucket,
            HelloFeature::Snappy if compression != CompressionMode::Off => &mut self.snappy,
            HelloFeature::Tracing => &mut self.tracing,
            _ => return false,
        };
        *slot = true;
        true
    }
}

/// Per-connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub authenticated: bool,
    pub features: Features,
    /// Agent name from the last HELLO.
    pub agent: Option<String>,
    /// Bucket named by SELECT_BUCKET.
    pub selected_bucket: Option<String>,
}

impl Session {
    /// Fresh session. Password-less buckets start authenticated.
    pub fn new(bucket: &Bucket) -> Self {
        Self {
            authenticated: bucket.password().is_empty(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Handler context
// ============================================================================

/// Everything a handler may look at while serving one request.
pub struct Context<'a> {
    pub bucket: &'a Bucket,
    pub node: &'a Node,
    pub request: &'a Request,
    pub opcode: Opcode,
    pub features: Features,
}

impl<'a> Context<'a> {
    pub fn storage(&self) -> &'a Storage {
        self.node.storage()
    }

    /// VBucket addressed by the request. Memcached buckets have only one.
    pub fn vbucket(&self) -> u16 {
        match self.bucket.bucket_type() {
            BucketType::Couchbase => self.request.header.vbucket,
            BucketType::Memcached => 0,
        }
    }

    pub fn key_spec(&self) -> KeySpec {
        KeySpec::new(self.request.key.clone(), self.vbucket())
    }

    /// Store serving the request's vbucket, if this node may.
    pub fn cache(&self, access: Access) -> Result<&'a VBucketStore, Failure> {
        Ok(self.storage().cache_for(self.vbucket(), access)?)
    }

    /// Empty success response to the request.
    pub fn response(&self) -> Response {
        Response::for_request(self.request, ErrorCode::Success)
    }

    /// Success response for a mutation, with coordinates when negotiated.
    pub fn mutation_response(&self, mutation: &Mutation) -> Response {
        let response = self.response().with_cas(mutation.cas);
        match self.mutation_extras(mutation) {
            Some(extras) => response.with_extras(extras),
            None => response,
        }
    }

    pub fn mutation_extras(&self, mutation: &Mutation) -> Option<Vec<u8>> {
        if !self.features.mutation_seqno {
            return None;
        }
        let mut extras = Vec::with_capacity(16);
        extras.extend_from_slice(&mutation.coords.uuid.to_be_bytes());
        extras.extend_from_slice(&mutation.coords.seqno.to_be_bytes());
        Some(extras)
    }

    /// Absolute expiry for a wire expiry value.
    pub fn expiry(&self, wire: u32) -> u32 {
        convert_expiry(self.storage().clock(), wire)
    }

    /// Datatype to report for a stored item.
    pub fn item_datatype(&self, item: &Item) -> u8 {
        let mut dt = item.datatype & !datatype::XATTR;
        if self.node.settings().compression() == CompressionMode::Off {
            dt &= !datatype::SNAPPY;
        }
        dt
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes requests arriving at one node to their handlers.
#[derive(Clone)]
pub struct Dispatcher {
    bucket: Arc<Bucket>,
    node: Arc<Node>,
}

impl Dispatcher {
    pub fn new(bucket: Arc<Bucket>, node: Arc<Node>) -> Self {
        Self { bucket, node }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Session for a newly accepted connection.
    pub fn session(&self) -> Session {
        Session::new(&self.bucket)
    }

    /// Serve one request.
    ///
    /// Framing violations come back as `Err` and must close the connection;
    /// every other problem is answered on the wire.
    pub fn dispatch(&self, session: &mut Session, request: &Request) -> MockResult<Outcome> {
        if !self.node.is_active() {
            tracing::trace!(node = self.node.index(), opcode = request.opcode(), "node inactive, dropping command");
            return Ok(Outcome::silent());
        }
        self.check_datatype(session, request)?;

        self.node.command_processed();
        let event_id = self.node.settings().enhanced_errors().then(|| nanoid!());
        let raw_opcode = request.opcode();
        self.node.faults().record(raw_opcode);

        if let Some(code) = self.node.faults().next_failure(raw_opcode) {
            tracing::debug!(node = self.node.index(), opcode = raw_opcode, code = %code, "forced failure");
            let response = self.failure_response(session, request, Failure::new(code), event_id.as_deref());
            return Ok(Outcome::one(response));
        }

        let opcode = match Opcode::try_from(raw_opcode) {
            Ok(opcode) => opcode,
            Err(raw) => {
                tracing::debug!(opcode = raw, "unknown opcode");
                let failure = Failure::new(ErrorCode::UnknownCommand);
                let response = self.failure_response(session, request, failure, event_id.as_deref());
                return Ok(Outcome::one(response));
            }
        };

        if !session.authenticated && !opcode.allowed_before_auth() {
            let failure = Failure::new(ErrorCode::AuthError).with_context("authentication required");
            let response = self.failure_response(session, request, failure, event_id.as_deref());
            return Ok(Outcome::one(response));
        }

        let started = Instant::now();
        let result = self.execute(session, opcode, request);
        Ok(self.finish(session, opcode, request, result, started.elapsed(), event_id))
    }

    fn check_datatype(&self, session: &Session, request: &Request) -> MockResult<()> {
        let mut allowed = datatype::JSON;
        if session.features.snappy {
            allowed |= datatype::SNAPPY;
        }
        let dt = request.header.datatype;
        if dt & !allowed != 0 {
            return Err(MockError::protocol(format!("unsupported datatype 0x{:02x}", dt)));
        }
        Ok(())
    }

    fn execute(&self, session: &mut Session, opcode: Opcode, request: &Request) -> HandlerResult {
        let command = Command::decode(opcode, request)?;
        if command.requires_vbuckets() && self.bucket.bucket_type() == BucketType::Memcached {
            return Err(Failure::new(ErrorCode::UnknownCommand));
        }
        tracing::trace!(node = self.node.index(), opcode = %opcode, key = %request.key_str(), "dispatch");

        let ctx = Context {
            bucket: &self.bucket,
            node: &self.node,
            request,
            opcode,
            features: session.features,
        };

        match command {
            Command::Get => retrieval::get(&ctx),
            Command::GetReplica => retrieval::get_replica(&ctx),
            Command::GetLocked { lock_time } => retrieval::get_locked(&ctx, lock_time),
            Command::Touch { expiry } => retrieval::touch(&ctx, expiry),
            Command::GetAndTouch { expiry } => retrieval::get_and_touch(&ctx, expiry),
            Command::Unlock => retrieval::unlock(&ctx),
            Command::GetRandomKey => retrieval::random_key(&ctx),
            Command::Store { mode, flags, expiry } => storage::store(&ctx, mode, flags, expiry),
            Command::Concat { prepend } => storage::concat(&ctx, prepend),
            Command::Delete => storage::delete(&ctx),
            Command::Arithmetic {
                increment,
                delta,
                initial,
                expiry,
            } => arithmetic::arithmetic(&ctx, increment, delta, initial, expiry),
            Command::Observe { keys } => observe::observe(&ctx, &keys),
            Command::ObserveSeqno { uuid } => observe::observe_seqno(&ctx, uuid),
            Command::Noop | Command::Verbosity => Ok(Reply::One(ctx.response())),
            Command::Version => other::version(&ctx),
            Command::Quit => other::quit(&ctx),
            Command::Flush => other::flush(&ctx),
            Command::Stat { group } => other::stat(&ctx, &group),
            Command::Hello { agent, features } => other::hello(&ctx, session, agent, &features),
            Command::SaslListMechs => other::sasl_list_mechs(&ctx),
            Command::SaslAuth { mechanism, payload } => {
                other::sasl_auth(&ctx, session, &mechanism, &payload)
            }
            Command::SaslStep => Err(Failure::new(ErrorCode::AuthError)),
            Command::GetErrorMap { version } => other::error_map(&ctx, version),
            Command::GetClusterConfig => other::cluster_config(&ctx),
            Command::SelectBucket { name } => other::select_bucket(&ctx, session, name),
            Command::Subdoc(req) => subdoc::single(&ctx, &req),
            Command::SubdocMulti(req) => subdoc::multi(&ctx, &req),
        }
    }

    fn finish(
        &self,
        session: &Session,
        opcode: Opcode,
        request: &Request,
        result: HandlerResult,
        elapsed: Duration,
        event_id: Option<String>,
    ) -> Outcome {
        let reply = match result {
            Ok(reply) => reply,
            Err(failure) => {
                tracing::trace!(opcode = %opcode, code = %failure.code, "command failed");
                Reply::One(self.failure_response(session, request, failure, event_id.as_deref()))
            }
        };

        match reply {
            Reply::One(response) => {
                let suppress = if opcode.is_quiet_get() {
                    response.status == ErrorCode::KeyEnoent
                } else {
                    opcode.is_quiet() && response.is_success()
                };
                if suppress {
                    return Outcome::silent();
                }
                if session.features.tracing && opcode != Opcode::Hello {
                    Outcome::one(response.with_trace(elapsed))
                } else {
                    Outcome::one(response)
                }
            }
            Reply::Many(responses) => Outcome {
                responses,
                close: false,
            },
            Reply::Silent => Outcome::silent(),
            Reply::Close(response) => Outcome {
                responses: response.into_iter().collect(),
                close: true,
            },
        }
    }

    fn failure_response(
        &self,
        session: &Session,
        request: &Request,
        failure: Failure,
        event_id: Option<&str>,
    ) -> Response {
        let response = Response::for_request(request, failure.code);

        if failure.code == ErrorCode::NotMyVbucket
            && self.node.settings().cccp()
            && self.bucket.bucket_type() == BucketType::Couchbase
        {
            return response.with_value(self.bucket.config_for(self.node.index()));
        }

        if !session.features.xerror || failure.code.is_success() {
            return response;
        }
        if event_id.is_none() && failure.context.is_none() {
            return response;
        }

        let mut error = Map::new();
        if let Some(id) = event_id {
            error.insert("ref".to_string(), Value::String(id.to_string()));
        }
        if let Some(context) = failure.context {
            error.insert("context".to_string(), Value::String(context));
        }
        let body = json!({ "error": error });
        match serde_json::to_vec(&body) {
            Ok(bytes) => response.with_json(bytes),
            Err(_) => response,
        }
    }
}
