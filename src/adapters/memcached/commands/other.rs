//! Connection, authentication and cluster commands.

use bytes::Bytes;

use super::{Context, Failure, HandlerResult, Reply, Session};
use crate::adapters::memcached::{HelloFeature, Opcode, Response};
use crate::core::error::ErrorCode;

/// Version string reported by VERSION and the default stats.
pub const MOCK_VERSION: &str = "9.9.9";

const ERROR_MAP_V1: &str = include_str!("../../../../resources/errmap_v1.json");

pub fn version(ctx: &Context<'_>) -> HandlerResult {
    Ok(Reply::One(ctx.response().with_value(MOCK_VERSION)))
}

/// QUIT answers before hanging up; QUITQ just hangs up.
pub fn quit(ctx: &Context<'_>) -> HandlerResult {
    if ctx.opcode == Opcode::QuitQ {
        Ok(Reply::Close(None))
    } else {
        Ok(Reply::Close(Some(ctx.response())))
    }
}

pub fn flush(ctx: &Context<'_>) -> HandlerResult {
    ctx.storage().flush();
    tracing::debug!(node = ctx.node.index(), bucket = %ctx.bucket.name(), "flushed");
    Ok(Reply::One(ctx.response()))
}

// ============================================================================
// Stats
// ============================================================================

/// STAT with an optional group name in the key.
///
/// Every stat is its own response; an empty SUCCESS response ends the batch.
pub fn stat(ctx: &Context<'_>, group: &str) -> HandlerResult {
    let stats = match group {
        "uuid" => vec![("uuid".to_string(), ctx.bucket.uuid().to_string())],
        "memory" => memory_stats(ctx),
        "tap" => Vec::new(),
        "__MOCK__" => mock_stats(ctx),
        "" => all_default_stats(ctx),
        name => all_default_stats(ctx)
            .into_iter()
            .filter(|(key, _)| key == name)
            .collect(),
    };

    let mut responses: Vec<Response> = stats
        .into_iter()
        .map(|(key, value)| ctx.response().with_key(key).with_value(value))
        .collect();
    responses.push(ctx.response());
    Ok(Reply::Many(responses))
}

/// Default stats of every active node in the bucket.
fn all_default_stats(ctx: &Context<'_>) -> Vec<(String, String)> {
    let now = ctx.storage().clock().now().secs();
    ctx.bucket
        .nodes()
        .iter()
        .filter(|node| node.is_active())
        .flat_map(|node| {
            let storage = node.storage();
            let items = storage.owned_items();
            let mem_used: usize = items.iter().map(|i| i.key_spec.key.len() + i.value.len()).sum();
            vec![
                ("pid".to_string(), std::process::id().to_string()),
                ("time".to_string(), now.to_string()),
                ("version".to_string(), MOCK_VERSION.to_string()),
                ("uptime".to_string(), node.uptime_secs().to_string()),
                ("accepting_conns".to_string(), "1".to_string()),
                ("curr_connections".to_string(), node.connections().to_string()),
                ("total_connections".to_string(), node.total_connections().to_string()),
                ("cmd_total".to_string(), node.commands().to_string()),
                ("curr_items".to_string(), items.len().to_string()),
                ("mem_used".to_string(), mem_used.to_string()),
            ]
        })
        .collect()
}

fn memory_stats(ctx: &Context<'_>) -> Vec<(String, String)> {
    let items = ctx.storage().owned_items();
    let used: usize = items.iter().map(|i| i.key_spec.key.len() + i.value.len()).sum();
    vec![
        ("mem_used".to_string(), used.to_string()),
        ("mem_max".to_string(), ctx.node.settings().max_value_size().to_string()),
    ]
}

fn mock_stats(ctx: &Context<'_>) -> Vec<(String, String)> {
    let owned = ctx.bucket.map().owned_by(ctx.node.index()).len();
    vec![
        ("node".to_string(), ctx.node.index().to_string()),
        ("bucket".to_string(), ctx.bucket.name().to_string()),
        ("bucket_type".to_string(), ctx.bucket.bucket_type().to_string()),
        ("active_vbuckets".to_string(), owned.to_string()),
        ("persist".to_string(), ctx.storage().persist_enabled().to_string()),
        ("replicate".to_string(), ctx.storage().replication_enabled().to_string()),
    ]
}

// ============================================================================
// Negotiation and authentication
// ============================================================================

/// HELLO replaces the negotiated feature set and echoes the accepted codes
/// in request order.
pub fn hello(ctx: &Context<'_>, session: &mut Session, agent: String, requested: &[u16]) -> HandlerResult {
    let compression = ctx.node.settings().compression();
    session.features = Default::default();
    if !agent.is_empty() {
        session.agent = Some(agent);
    }

    let mut accepted: Vec<u16> = Vec::with_capacity(requested.len());
    for &code in requested {
        if accepted.contains(&code) {
            continue;
        }
        let Some(feature) = HelloFeature::from_code(code) else {
            continue;
        };
        if session.features.enable(feature, compression) {
            accepted.push(code);
        }
    }
    tracing::debug!(
        node = ctx.node.index(),
        agent = session.agent.as_deref().unwrap_or(""),
        features = ?accepted,
        "hello"
    );

    let body: Vec<u8> = accepted.iter().flat_map(|code| code.to_be_bytes()).collect();
    Ok(Reply::One(ctx.response().with_value(body)))
}

pub fn sasl_list_mechs(ctx: &Context<'_>) -> HandlerResult {
    Ok(Reply::One(ctx.response().with_value("PLAIN")))
}

/// PLAIN authentication: `authzid \0 user \0 password`, checked against the
/// bucket name and password.
pub fn sasl_auth(ctx: &Context<'_>, session: &mut Session, mechanism: &str, payload: &Bytes) -> HandlerResult {
    if mechanism != "PLAIN" {
        return Err(Failure::new(ErrorCode::AuthError).with_context(format!("unsupported mechanism {}", mechanism)));
    }
    let mut parts = payload.split(|b| *b == 0);
    let _authzid = parts.next();
    let user = parts.next().unwrap_or_default();
    let password = parts.next().unwrap_or_default();

    if user != ctx.bucket.name().as_bytes() || password != ctx.bucket.password().as_bytes() {
        tracing::debug!(node = ctx.node.index(), bucket = %ctx.bucket.name(), "authentication failed");
        return Err(Failure::new(ErrorCode::AuthError));
    }
    session.authenticated = true;
    Ok(Reply::One(ctx.response().with_value("Authenticated")))
}

// ============================================================================
// Cluster
// ============================================================================

pub fn error_map(ctx: &Context<'_>, version: u16) -> HandlerResult {
    if version == 0 {
        return Err(Failure::new(ErrorCode::KeyEnoent));
    }
    Ok(Reply::One(ctx.response().with_json(ERROR_MAP_V1)))
}

pub fn cluster_config(ctx: &Context<'_>) -> HandlerResult {
    if !ctx.node.settings().cccp() {
        return Err(Failure::new(ErrorCode::NotSupported));
    }
    let config = ctx.bucket.config_for(ctx.node.index());
    Ok(Reply::One(ctx.response().with_json(config)))
}

pub fn select_bucket(ctx: &Context<'_>, session: &mut Session, name: String) -> HandlerResult {
    tracing::debug!(node = ctx.node.index(), bucket = %name, "bucket selected");
    session.selected_bucket = Some(name);
    Ok(Reply::One(ctx.response()))
}
