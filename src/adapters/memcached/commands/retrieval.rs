//! Retrieval commands: get and its variants, touch, get-and-lock, unlock and
//! random key.
//!
//! Quiet gets (`GETQ`, `GETKQ`, `GATQ`) report a miss as `KEY_ENOENT`; the
//! dispatcher drops that response before it reaches the wire.

use rand::seq::SliceRandom;

use super::{Context, Failure, HandlerResult, Reply};
use crate::adapters::memcached::{Opcode, Response};
use crate::core::error::ErrorCode;
use crate::storage::{Access, Item};

/// GET, GETQ, GETK and GETKQ.
pub fn get(ctx: &Context<'_>) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    let item = ctx
        .storage()
        .apply(cache.get(&ctx.key_spec()))
        .ok_or(ErrorCode::KeyEnoent)?;
    let cas = item.visible_cas(cache.now());
    Ok(Reply::One(item_response(ctx, &item, cas)))
}

/// Read from the active copy or any replica. The active node answers too,
/// so a client that only knows the map can ask any copy holder.
pub fn get_replica(ctx: &Context<'_>) -> HandlerResult {
    let cache = ctx.cache(Access::OwnerOrReplica)?;
    let item = ctx
        .storage()
        .apply(cache.get(&ctx.key_spec()))
        .ok_or(ErrorCode::KeyEnoent)?;
    let cas = item.visible_cas(cache.now());
    Ok(Reply::One(item_response(ctx, &item, cas)))
}

/// GETL. The returned CAS is the only one that unlocks the item.
pub fn get_locked(ctx: &Context<'_>, lock_time: u32) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    let item = ctx.storage().apply(cache.lock(&ctx.key_spec(), lock_time))?;
    tracing::trace!(key = %item.key_spec, cas = item.cas, "item locked");
    Ok(Reply::One(item_response(ctx, &item, item.cas)))
}

/// TOUCH answers with the new CAS only.
pub fn touch(ctx: &Context<'_>, expiry: u32) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    let item = ctx
        .storage()
        .apply(cache.touch(&ctx.key_spec(), ctx.expiry(expiry)))?;
    Ok(Reply::One(ctx.response().with_cas(item.cas)))
}

/// GAT and GATQ.
pub fn get_and_touch(ctx: &Context<'_>, expiry: u32) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    let item = ctx
        .storage()
        .apply(cache.touch(&ctx.key_spec(), ctx.expiry(expiry)))?;
    Ok(Reply::One(item_response(ctx, &item, item.cas)))
}

pub fn unlock(ctx: &Context<'_>) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    ctx.storage()
        .apply(cache.unlock(&ctx.key_spec(), ctx.request.header.cas))?;
    Ok(Reply::One(ctx.response()))
}

/// Any live item this node is active for.
pub fn random_key(ctx: &Context<'_>) -> HandlerResult {
    let items = ctx.storage().owned_items();
    let item = items
        .choose(&mut rand::thread_rng())
        .ok_or_else(|| Failure::new(ErrorCode::KeyEnoent))?;
    let cas = item.visible_cas(ctx.storage().cache().now());
    Ok(Reply::One(
        item_response(ctx, item, cas).with_key(item.key_spec.key.clone()),
    ))
}

/// Response carrying an item's flags, value and CAS.
fn item_response(ctx: &Context<'_>, item: &Item, cas: u64) -> Response {
    let response = ctx
        .response()
        .with_cas(cas)
        .with_extras(item.flags.to_be_bytes().to_vec())
        .with_datatype(ctx.item_datatype(item))
        .with_value(item.value.clone());
    match ctx.opcode {
        Opcode::GetK | Opcode::GetKQ | Opcode::GetReplica => response.with_key(item.key_spec.key.clone()),
        _ => response,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::adapters::memcached::{Opcode, Request};
    use crate::core::config::BucketType;
    use crate::core::error::ErrorCode;
    use crate::storage::LOCKED_CAS;

    fn getl(key: &str, lock_time: u32) -> Request {
        Request::new(Opcode::GetLocked)
            .with_key(key.to_string())
            .with_extras(lock_time.to_be_bytes().to_vec())
    }

    #[test]
    fn test_get_returns_flags_and_key() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let store = Request::new(Opcode::Set)
            .with_key("k")
            .with_extras(vec![0, 0, 0, 42, 0, 0, 0, 0])
            .with_value("v");
        call(&dispatcher, &mut session, store);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("k"));
        assert_eq!(get.extras, vec![0u8, 0, 0, 42]);
        assert!(get.key.is_empty());

        let getk = call(&dispatcher, &mut session, Request::new(Opcode::GetK).with_key("k"));
        assert_eq!(getk.key, "k");
        assert_eq!(getk.value, "v");
    }

    #[test]
    fn test_lock_and_unlock() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        call(&dispatcher, &mut session, set("k", "v"));

        let locked = call(&dispatcher, &mut session, getl("k", 10));
        assert!(locked.is_success());
        assert_ne!(locked.cas, LOCKED_CAS);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("k"));
        assert_eq!(get.cas, LOCKED_CAS);

        assert_eq!(call(&dispatcher, &mut session, set("k", "x")).status, ErrorCode::KeyEexists);
        assert_eq!(call(&dispatcher, &mut session, getl("k", 10)).status, ErrorCode::Etmpfail);

        let bad = Request::new(Opcode::UnlockKey).with_key("k").with_cas(locked.cas + 1);
        assert_eq!(call(&dispatcher, &mut session, bad).status, ErrorCode::Etmpfail);
        let good = Request::new(Opcode::UnlockKey).with_key("k").with_cas(locked.cas);
        assert!(call(&dispatcher, &mut session, good).is_success());
        assert!(call(&dispatcher, &mut session, set("k", "x")).is_success());
    }

    #[test]
    fn test_set_with_lock_cas_unlocks() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        call(&dispatcher, &mut session, set("k", "v"));
        let locked = call(&dispatcher, &mut session, getl("k", 10));
        let update = set("k", "w").with_cas(locked.cas);
        assert!(call(&dispatcher, &mut session, update).is_success());
        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("k"));
        assert_ne!(get.cas, LOCKED_CAS);
    }

    #[test]
    fn test_touch_and_gat() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let stored = call(&dispatcher, &mut session, set("k", "v"));

        let touch = Request::new(Opcode::Touch).with_key("k").with_extras(vec![0, 0, 0, 100]);
        let touched = call(&dispatcher, &mut session, touch);
        assert!(touched.is_success());
        assert!(touched.value.is_empty());
        assert!(touched.cas >= stored.cas);

        let gat = Request::new(Opcode::Gat).with_key("k").with_extras(vec![0, 0, 0, 100]);
        assert_eq!(call(&dispatcher, &mut session, gat).value, "v");

        let gatq = Request::new(Opcode::GatQ).with_key("nope").with_extras(vec![0, 0, 0, 1]);
        assert!(dispatcher.dispatch(&mut session, &gatq).unwrap().responses.is_empty());
    }

    #[test]
    fn test_get_replica() {
        let bucket = bucket_with(BucketType::Couchbase, "");
        let owner_dispatcher = dispatcher_for(bucket.clone());
        let mut session = owner_dispatcher.session();
        call(&owner_dispatcher, &mut session, set("k", "v"));

        let info = bucket.map().get(0).unwrap();
        let replica = info.replicas[0];
        let replica_dispatcher = super::super::Dispatcher::new(bucket.clone(), bucket.nodes()[replica].clone());
        let mut session = replica_dispatcher.session();

        let got = call(&replica_dispatcher, &mut session, Request::new(Opcode::GetReplica).with_key("k"));
        assert_eq!(got.value, "v");
        assert_eq!(got.key, "k");

        let plain = call(&replica_dispatcher, &mut session, Request::new(Opcode::Get).with_key("k"));
        assert_eq!(plain.status, ErrorCode::NotMyVbucket);
    }

    #[test]
    fn test_get_replica_served_by_active_node() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        call(&dispatcher, &mut session, set("k", "v"));

        let got = call(&dispatcher, &mut session, Request::new(Opcode::GetReplica).with_key("k"));
        assert!(got.is_success());
        assert_eq!(got.value, "v");
        assert_eq!(got.key, "k");

        let missing = call(&dispatcher, &mut session, Request::new(Opcode::GetReplica).with_key("nope"));
        assert_eq!(missing.status, ErrorCode::KeyEnoent);
    }

    #[test]
    fn test_random_key() {
        let bucket = bucket_with(BucketType::Couchbase, "");
        let dispatcher = dispatcher_for(bucket);
        let mut session = dispatcher.session();
        let random = Request::new(Opcode::GetRandomKey);
        assert_eq!(call(&dispatcher, &mut session, random.clone()).status, ErrorCode::KeyEnoent);

        call(&dispatcher, &mut session, set("only", "v"));
        let got = call(&dispatcher, &mut session, random);
        assert_eq!(got.key, "only");
        assert_eq!(got.value, "v");
    }
}
