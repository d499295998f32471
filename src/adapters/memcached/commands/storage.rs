//! Storage commands: set, add, replace, append, prepend, delete.

use super::{Context, Failure, HandlerResult, Reply, StoreMode};
use crate::core::error::ErrorCode;
use crate::storage::{datatype, Access, Item};

/// SET, ADD and REPLACE.
///
/// Oversized values are refused before the store is touched.
pub fn store(ctx: &Context<'_>, mode: StoreMode, flags: u32, expiry: u32) -> HandlerResult {
    check_value_size(ctx)?;
    let cache = ctx.cache(Access::Owner)?;
    let item = Item::new(
        ctx.key_spec(),
        flags,
        ctx.expiry(expiry),
        ctx.request.value.clone(),
        ctx.request.header.cas,
    )
    .with_datatype(ctx.request.header.datatype & (datatype::JSON | datatype::SNAPPY));

    let applied = match mode {
        StoreMode::Set => cache.set(item),
        StoreMode::Add => cache.add(item),
        StoreMode::Replace => cache.replace(item),
    };
    let mutation = ctx.storage().apply(applied)?;
    Ok(Reply::One(ctx.mutation_response(&mutation)))
}

/// APPEND and PREPEND. The merged value is held to the same limit as a SET.
pub fn concat(ctx: &Context<'_>, prepend: bool) -> HandlerResult {
    check_value_size(ctx)?;
    let cache = ctx.cache(Access::Owner)?;
    let item = Item::new(
        ctx.key_spec(),
        0,
        0,
        ctx.request.value.clone(),
        ctx.request.header.cas,
    );
    let limit = ctx.node.settings().max_value_size();
    let applied = if prepend {
        cache.prepend(item, limit)
    } else {
        cache.append(item, limit)
    };
    let mutation = ctx.storage().apply(applied).map_err(|code| match code {
        ErrorCode::KeyEnoent => ErrorCode::NotStored,
        other => other,
    })?;
    Ok(Reply::One(ctx.mutation_response(&mutation)))
}

pub fn delete(ctx: &Context<'_>) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    let applied = cache.delete(&ctx.key_spec(), ctx.request.header.cas);
    let mutation = ctx.storage().apply(applied)?;
    Ok(Reply::One(ctx.mutation_response(&mutation)))
}

fn check_value_size(ctx: &Context<'_>) -> Result<(), Failure> {
    let limit = ctx.node.settings().max_value_size();
    let len = ctx.request.value.len();
    if len > limit {
        return Err(Failure::new(ErrorCode::E2big)
            .with_context(format!("value of {} bytes exceeds limit of {}", len, limit)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::adapters::memcached::{Opcode, Request};
    use crate::core::error::ErrorCode;

    #[test]
    fn test_add_twice() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let add = Request::new(Opcode::Add).with_key("k").with_extras(vec![0u8; 8]).with_value("v");

        let first = call(&dispatcher, &mut session, add.clone());
        assert!(first.is_success());
        assert!(first.cas > 0);
        let second = call(&dispatcher, &mut session, add);
        assert_eq!(second.status, ErrorCode::KeyEexists);
    }

    #[test]
    fn test_cas_increases() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let a = call(&dispatcher, &mut session, set("a", "1"));
        let b = call(&dispatcher, &mut session, set("b", "2"));
        assert!(b.cas > a.cas);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("b"));
        assert_eq!(get.cas, b.cas);
    }

    #[test]
    fn test_stale_cas_rejected() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let stored = call(&dispatcher, &mut session, set("k", "orig"));

        let replace = Request::new(Opcode::Replace)
            .with_key("k")
            .with_extras(vec![0u8; 8])
            .with_value("new")
            .with_cas(stored.cas + 100);
        assert_eq!(call(&dispatcher, &mut session, replace).status, ErrorCode::KeyEexists);

        let delete = Request::new(Opcode::Delete).with_key("k").with_cas(stored.cas + 100);
        assert_eq!(call(&dispatcher, &mut session, delete).status, ErrorCode::KeyEexists);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("k"));
        assert_eq!(get.value, "orig");
        assert_eq!(get.cas, stored.cas);
    }

    #[test]
    fn test_append_prepend() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let base = call(&dispatcher, &mut session, set("k", "M"));

        let append = call(&dispatcher, &mut session, Request::new(Opcode::Append).with_key("k").with_value("X"));
        assert!(append.cas > base.cas);
        let prepend = call(&dispatcher, &mut session, Request::new(Opcode::Prepend).with_key("k").with_value("Y"));
        assert!(prepend.cas > append.cas);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("k"));
        assert_eq!(get.value, "YMX");

        let missing = call(&dispatcher, &mut session, Request::new(Opcode::Append).with_key("nope").with_value("X"));
        assert_eq!(missing.status, ErrorCode::NotStored);
    }

    #[test]
    fn test_value_too_big() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let limit = dispatcher.node().settings().max_value_size();
        let big = Request::new(Opcode::Set)
            .with_key("big")
            .with_extras(vec![0u8; 8])
            .with_value(vec![b'x'; limit + 1]);
        assert_eq!(call(&dispatcher, &mut session, big).status, ErrorCode::E2big);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("big"));
        assert_eq!(get.status, ErrorCode::KeyEnoent);
    }

    #[test]
    fn test_append_cannot_outgrow_limit() {
        let dispatcher = dispatcher_for(bucket_with_limit(8));
        let mut session = dispatcher.session();
        call(&dispatcher, &mut session, set("k", "12345"));

        let append = Request::new(Opcode::Append).with_key("k").with_value("6789");
        assert_eq!(call(&dispatcher, &mut session, append).status, ErrorCode::E2big);
        let prepend = Request::new(Opcode::Prepend).with_key("k").with_value("abcd");
        assert_eq!(call(&dispatcher, &mut session, prepend).status, ErrorCode::E2big);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("k"));
        assert_eq!(get.value, "12345");

        let fits = Request::new(Opcode::Append).with_key("k").with_value("678");
        assert!(call(&dispatcher, &mut session, fits).is_success());
    }

    #[test]
    fn test_mutation_seqno_extras() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let plain = call(&dispatcher, &mut session, set("k", "v"));
        assert!(plain.extras.is_empty());

        session.features.mutation_seqno = true;
        let first = call(&dispatcher, &mut session, set("k", "v"));
        let second = call(&dispatcher, &mut session, set("k", "w"));
        assert_eq!(first.extras.len(), 16);
        let seqno = |extras: &[u8]| u64::from_be_bytes(extras[8..16].try_into().unwrap());
        assert_eq!(seqno(&second.extras), seqno(&first.extras) + 1);
        assert_eq!(first.extras[..8], second.extras[..8]);
    }

    #[test]
    fn test_delete() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        call(&dispatcher, &mut session, set("k", "v"));
        let delete = call(&dispatcher, &mut session, Request::new(Opcode::Delete).with_key("k"));
        assert!(delete.is_success());
        let again = call(&dispatcher, &mut session, Request::new(Opcode::Delete).with_key("k"));
        assert_eq!(again.status, ErrorCode::KeyEnoent);
    }
}
