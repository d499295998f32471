//! Memcached protocol integration tests.
//!
//! Every test talks to a running cluster over real sockets.

mod common;

use bytes::{Buf, BufMut, BytesMut};
use cbmock::adapters::memcached::{Opcode, Request};
use cbmock::error::ErrorCode;
use cbmock::storage::LOCKED_CAS;
use common::{set, start, small_config, subdoc, Client};
use serde_json::Value;

fn arithmetic(opcode: Opcode, key: &str, delta: u64, initial: u64, expiry: u32) -> Request {
    let mut extras = BytesMut::new();
    extras.put_u64(delta);
    extras.put_u64(initial);
    extras.put_u32(expiry);
    Request::new(opcode).with_key(key.to_string()).with_extras(extras.freeze())
}

// ============================================================================
// Storage and retrieval
// ============================================================================

#[tokio::test]
async fn set_get_delete_roundtrip() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "doc").await;

    let stored = client.set("doc", "hello").await;
    assert!(stored.is_success());
    assert_ne!(stored.cas, 0);

    let fetched = client.get("doc").await;
    assert_eq!(fetched.value, "hello");
    assert_eq!(fetched.cas, stored.cas);
    assert_eq!(fetched.extras.len(), 4);

    let deleted = client.call(Request::new(Opcode::Delete).with_key("doc")).await;
    assert!(deleted.is_success());
    assert_eq!(client.get("doc").await.status, ErrorCode::KeyEnoent);
}

#[tokio::test]
async fn add_replace_and_cas_conflicts() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "k").await;

    let replace = Request::new(Opcode::Replace)
        .with_key("k")
        .with_extras(vec![0u8; 8])
        .with_value("x");
    assert_eq!(client.call(replace.clone()).await.status, ErrorCode::KeyEnoent);

    let add = Request::new(Opcode::Add)
        .with_key("k")
        .with_extras(vec![0u8; 8])
        .with_value("v1");
    let first = client.call(add.clone()).await;
    assert!(first.is_success());
    assert_eq!(client.call(add).await.status, ErrorCode::KeyEexists);

    let stale = set("k", "v2").with_cas(first.cas + 1000);
    assert_eq!(client.call(stale).await.status, ErrorCode::KeyEexists);

    let fresh = set("k", "v2").with_cas(first.cas);
    let second = client.call(fresh).await;
    assert!(second.is_success());
    assert!(second.cas > first.cas);
}

#[tokio::test]
async fn append_and_prepend() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "s").await;

    let append = Request::new(Opcode::Append).with_key("s").with_value("b");
    assert_eq!(client.call(append.clone()).await.status, ErrorCode::NotStored);

    client.set("s", "a").await;
    client.call(append).await;
    client
        .call(Request::new(Opcode::Prepend).with_key("s").with_value("_"))
        .await;
    assert_eq!(client.get("s").await.value, "_ab");
}

#[tokio::test]
async fn quiet_commands_answer_only_on_failure() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "q").await;

    let setq = client.route(
        Request::new(Opcode::SetQ)
            .with_key("q")
            .with_extras(vec![0u8; 8])
            .with_value("v")
            .with_opaque(1),
    );
    let getq_hit = client.route(Request::new(Opcode::GetQ).with_key("q").with_opaque(3));
    client.write(&setq).await;
    client.write(&getq_hit).await;
    client.write(&Request::new(Opcode::Noop).with_opaque(4)).await;

    let hit = client.read().await.unwrap();
    assert_eq!(hit.opaque, 3);
    assert_eq!(hit.value, "v");
    assert_eq!(client.read().await.unwrap().opaque, 4);
}

#[tokio::test]
async fn wrong_node_gets_not_my_vbucket_with_config() {
    let runtime = start(small_config()).await;
    let owner = common::owner_of(&runtime, "elsewhere");
    let other = (owner + 1) % 3;
    let replica = common::replica_of(&runtime, "elsewhere");
    let target = if other == replica { (owner + 2) % 3 } else { other };

    let mut client = Client::connect(&runtime, target).await;
    let response = client.set("elsewhere", "v").await;
    assert_eq!(response.status, ErrorCode::NotMyVbucket);
    let config: Value = serde_json::from_slice(&response.value).unwrap();
    assert_eq!(config["name"], "default");
    assert!(config["vBucketServerMap"]["vBucketMap"].is_array());
}

#[tokio::test]
async fn replica_read_and_locking() {
    let runtime = start(small_config()).await;
    let mut master = Client::for_key(&runtime, "lk").await;
    let mut replica = Client::connect(&runtime, common::replica_of(&runtime, "lk")).await;

    master.set("lk", "v").await;
    let copy = replica
        .call(Request::new(Opcode::GetReplica).with_key("lk"))
        .await;
    assert!(copy.is_success());
    assert_eq!(copy.value, "v");

    let locked = master
        .call(
            Request::new(Opcode::GetLocked)
                .with_key("lk")
                .with_extras(5u32.to_be_bytes().to_vec()),
        )
        .await;
    assert!(locked.is_success());

    assert_eq!(master.get("lk").await.cas, LOCKED_CAS);
    assert_eq!(master.set("lk", "blocked").await.status, ErrorCode::KeyEexists);

    let unlock = Request::new(Opcode::UnlockKey).with_key("lk").with_cas(locked.cas);
    assert!(master.call(unlock).await.is_success());
    assert!(master.set("lk", "free").await.is_success());
}

// ============================================================================
// Arithmetic
// ============================================================================

#[tokio::test]
async fn counters_create_and_step() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "ctr").await;

    let created = client
        .call(arithmetic(Opcode::Increment, "ctr", 5, 10, 0))
        .await;
    assert!(created.is_success());
    assert_eq!(created.value.clone().get_u64(), 10);

    let bumped = client
        .call(arithmetic(Opcode::Increment, "ctr", 5, 0, 0))
        .await;
    assert_eq!(bumped.value.clone().get_u64(), 15);

    let lowered = client
        .call(arithmetic(Opcode::Decrement, "ctr", 20, 0, 0))
        .await;
    assert_eq!(lowered.status, ErrorCode::DeltaBadval);

    let no_create = client
        .call(arithmetic(Opcode::Increment, "absent", 1, 0, u32::MAX))
        .await;
    assert_eq!(no_create.status, ErrorCode::KeyEnoent);

    client.set("text", "abc").await;
    let bad = client
        .call(arithmetic(Opcode::Increment, "text", 1, 0, 0))
        .await;
    assert_eq!(bad.status, ErrorCode::DeltaBadval);
}

// ============================================================================
// Observe
// ============================================================================

#[tokio::test]
async fn observe_reports_persisted_state() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "obs").await;
    let stored = client.set("obs", "v").await;

    let vb = common::bucket(&runtime).vbucket_for_key(b"obs");
    let mut body = BytesMut::new();
    body.put_u16(vb);
    body.put_u16(3);
    body.put_slice(b"obs");
    let response = client
        .call(Request::new(Opcode::Observe).with_value(body.freeze()))
        .await;
    assert!(response.is_success());

    let mut value = response.value.clone();
    assert_eq!(value.get_u16(), vb);
    let keylen = value.get_u16() as usize;
    assert_eq!(&value[..keylen], b"obs");
    value.advance(keylen);
    assert_eq!(value.get_u8(), 0x01);
    assert_eq!(value.get_u64(), stored.cas);
}

// ============================================================================
// Session commands
// ============================================================================

#[tokio::test]
async fn hello_negotiates_mutation_seqno() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "seq").await;

    let mut features = BytesMut::new();
    features.put_u16(0x04);
    features.put_u16(0x0a);
    let hello = client
        .call(
            Request::new(Opcode::Hello)
                .with_key("test-agent")
                .with_value(features.freeze()),
        )
        .await;
    // snappy is refused while compression is off
    assert_eq!(&hello.value[..], &[0x00, 0x04]);

    let stored = client.set("seq", "v").await;
    assert_eq!(stored.extras.len(), 16);
}

#[tokio::test]
async fn stat_stream_ends_with_empty_response() {
    let runtime = start(small_config()).await;
    let mut client = Client::connect(&runtime, 0).await;
    client.write(&Request::new(Opcode::Stat).with_opaque(9)).await;

    let mut stats = Vec::new();
    loop {
        let response = client.read().await.unwrap();
        assert_eq!(response.opaque, 9);
        if response.key.is_empty() {
            break;
        }
        stats.push(String::from_utf8_lossy(&response.key).to_string());
    }
    assert!(stats.iter().any(|k| k == "version"));
}

#[tokio::test]
async fn error_map_and_cluster_config() {
    let runtime = start(small_config()).await;
    let mut client = Client::connect(&runtime, 0).await;

    let map = client
        .call(Request::new(Opcode::GetErrorMap).with_value(1u16.to_be_bytes().to_vec()))
        .await;
    let map: Value = serde_json::from_slice(&map.value).unwrap();
    assert_eq!(map["version"], 1);

    let config = client.call(Request::new(Opcode::GetClusterConfig)).await;
    assert!(config.is_success());
    let text = String::from_utf8(config.value.to_vec()).unwrap();
    assert!(text.contains("$HOST"));
}

#[tokio::test]
async fn quit_closes_connection() {
    let runtime = start(small_config()).await;
    let mut client = Client::connect(&runtime, 0).await;
    client.write(&Request::new(Opcode::Quit)).await;
    assert!(client.read().await.unwrap().is_success());
    assert!(client.read().await.is_none());
}

#[tokio::test]
async fn password_bucket_requires_sasl() {
    let config = cbmock::config::Config::from_toml(
        r#"
[cluster]
nodes = 1
replicas = 0
vbuckets = 4

[[buckets]]
name = "secure"
password = "pw"
"#,
    )
    .unwrap();
    let runtime = start(config).await;
    let mut client = Client::connect_bucket(&runtime, "secure", 0).await;
    assert_eq!(client.set("a", "b").await.status, ErrorCode::AuthError);

    let auth = Request::new(Opcode::SaslAuth)
        .with_key("PLAIN")
        .with_value(&b"\0secure\0pw"[..]);
    assert!(client.call(auth).await.is_success());
    assert!(client.set("a", "b").await.is_success());
}

// ============================================================================
// Sub-document
// ============================================================================

#[tokio::test]
async fn subdoc_mutation_and_lookup() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "json").await;
    client
        .call(set("json", r#"{"a":{"b":[1,2]}}"#))
        .await;

    let push = client
        .call(subdoc(Opcode::SubdocArrayPushLast, "json", "a.b", "3"))
        .await;
    assert!(push.is_success());

    let get = client.call(subdoc(Opcode::SubdocGet, "json", "a.b", "")).await;
    assert_eq!(get.value, "[1,2,3]");

    let missing = client.call(subdoc(Opcode::SubdocGet, "json", "a.zz", "")).await;
    assert_eq!(missing.status, ErrorCode::SubdocPathEnoent);

    let count = client.call(subdoc(Opcode::SubdocGetCount, "json", "a.b", "")).await;
    assert_eq!(count.value, "3");
}
