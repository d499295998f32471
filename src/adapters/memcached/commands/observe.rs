//! OBSERVE and OBSERVE_SEQNO.
//!
//! ```text
//!   observe entry:        vb u16 | keylen u16 | key | state u8 | cas u64
//!   observe-seqno 0x00:   0x00 | vb u16 | uuid u64 | persisted u64 | current u64
//!   observe-seqno 0x01:   0x01 | vb u16 | uuid u64 | persisted u64 | current u64
//!                         | old uuid u64 | old seqno u64
//! ```

use bytes::{BufMut, BytesMut};

use super::{Context, HandlerResult, Reply};
use crate::storage::{KeySpec, SeqnoObservation};

pub fn observe(ctx: &Context<'_>, keys: &[KeySpec]) -> HandlerResult {
    let mut body = BytesMut::new();
    for ks in keys {
        let (state, cas) = ctx.storage().observe(ks)?;
        body.put_u16(ks.vbucket);
        body.put_u16(ks.key.len() as u16);
        body.put_slice(&ks.key);
        body.put_u8(state as u8);
        body.put_u64(cas);
    }
    Ok(Reply::One(ctx.response().with_value(body.freeze())))
}

pub fn observe_seqno(ctx: &Context<'_>, uuid: u64) -> HandlerResult {
    let observation = ctx.storage().observe_seqno(ctx.vbucket(), uuid)?;
    let mut body = BytesMut::with_capacity(43);
    match observation {
        SeqnoObservation::Current {
            vbucket,
            uuid,
            persisted_seqno,
            current_seqno,
        } => {
            body.put_u8(0x00);
            body.put_u16(vbucket);
            body.put_u64(uuid);
            body.put_u64(persisted_seqno);
            body.put_u64(current_seqno);
        }
        SeqnoObservation::Failover {
            vbucket,
            uuid,
            persisted_seqno,
            current_seqno,
            old_uuid,
            old_seqno,
        } => {
            body.put_u8(0x01);
            body.put_u16(vbucket);
            body.put_u64(uuid);
            body.put_u64(persisted_seqno);
            body.put_u64(current_seqno);
            body.put_u64(old_uuid);
            body.put_u64(old_seqno);
        }
    }
    Ok(Reply::One(ctx.response().with_value(body.freeze())))
}
