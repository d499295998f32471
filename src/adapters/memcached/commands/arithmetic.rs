//! INCREMENT and DECREMENT.
//!
//! Counters are stored as decimal text. The expiry `0xffffffff` means the
//! counter must already exist.

use super::{Context, HandlerResult, Reply};
use crate::storage::{Access, ArithmeticSpec};

const NO_CREATE: u32 = 0xffff_ffff;

pub fn arithmetic(
    ctx: &Context<'_>,
    increment: bool,
    delta: u64,
    initial: u64,
    expiry: u32,
) -> HandlerResult {
    let cache = ctx.cache(Access::Owner)?;
    let (initial, expiry) = if expiry == NO_CREATE {
        (None, 0)
    } else {
        (Some(initial), ctx.expiry(expiry))
    };
    let spec = ArithmeticSpec {
        increment,
        delta,
        initial,
        expiry,
        cas: ctx.request.header.cas,
    };
    let counter = ctx.storage().apply(cache.arithmetic(&ctx.key_spec(), spec))?;
    let response = ctx
        .mutation_response(&counter.mutation)
        .with_value(counter.value.to_be_bytes().to_vec());
    Ok(Reply::One(response))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::adapters::memcached::{Opcode, Request, Response};
    use crate::core::error::ErrorCode;

    fn counter(op: Opcode, key: &str, delta: u64, initial: u64, expiry: u32) -> Request {
        let mut extras = Vec::with_capacity(20);
        extras.extend_from_slice(&delta.to_be_bytes());
        extras.extend_from_slice(&initial.to_be_bytes());
        extras.extend_from_slice(&expiry.to_be_bytes());
        Request::new(op).with_key(key.to_string()).with_extras(extras)
    }

    fn value_of(response: &Response) -> u64 {
        u64::from_be_bytes(response.value[..8].try_into().unwrap())
    }

    #[test]
    fn test_create_then_increment() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();

        let created = call(&dispatcher, &mut session, counter(Opcode::Increment, "c", 5, 10, 0));
        assert_eq!(value_of(&created), 10);
        let bumped = call(&dispatcher, &mut session, counter(Opcode::Increment, "c", 5, 10, 0));
        assert_eq!(value_of(&bumped), 15);
        assert!(bumped.cas > created.cas);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("c"));
        assert_eq!(get.value, "15");
    }

    #[test]
    fn test_no_create() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let response = call(&dispatcher, &mut session, counter(Opcode::Decrement, "c", 1, 0, 0xffff_ffff));
        assert_eq!(response.status, ErrorCode::KeyEnoent);
    }

    #[test]
    fn test_checked_bounds() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        call(&dispatcher, &mut session, set("c", "3"));

        let under = call(&dispatcher, &mut session, counter(Opcode::Decrement, "c", 4, 0, 0));
        assert_eq!(under.status, ErrorCode::DeltaBadval);

        call(&dispatcher, &mut session, set("max", &u64::MAX.to_string()));
        let over = call(&dispatcher, &mut session, counter(Opcode::Increment, "max", 1, 0, 0));
        assert_eq!(over.status, ErrorCode::DeltaBadval);

        let get = call(&dispatcher, &mut session, Request::new(Opcode::Get).with_key("c"));
        assert_eq!(get.value, "3");
    }

    #[test]
    fn test_non_numeric_value() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        call(&dispatcher, &mut session, set("c", "abc"));
        let response = call(&dispatcher, &mut session, counter(Opcode::Increment, "c", 1, 0, 0));
        assert_eq!(response.status, ErrorCode::DeltaBadval);
    }

    #[test]
    fn test_quiet_increment_is_silent() {
        let dispatcher = dispatcher();
        let mut session = dispatcher.session();
        let request = counter(Opcode::IncrementQ, "c", 1, 1, 0);
        assert!(dispatcher.dispatch(&mut session, &request).unwrap().responses.is_empty());
    }
}
