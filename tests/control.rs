//! Control channel integration tests.
//!
//! Faults and topology changes are driven over the JSON control channel and
//! observed through the binary protocol.

mod common;

use std::time::{Duration, Instant};

use cbmock::adapters::memcached::{Opcode, Request};
use cbmock::error::ErrorCode;
use common::{small_config, start, Client, ControlClient};
use serde_json::json;

// ============================================================================
// Topology
// ============================================================================

#[tokio::test]
async fn failover_moves_ownership() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;

    let owner = common::owner_of(&runtime, "moving");
    let mut old_owner = Client::connect(&runtime, owner).await;
    let rev = common::bucket(&runtime).rev();

    control.ok("FAILOVER", json!({"idx": owner})).await;
    assert!(common::bucket(&runtime).rev() > rev);

    let new_owner = common::owner_of(&runtime, "moving");
    assert_ne!(new_owner, owner);
    let mut client = Client::connect(&runtime, new_owner).await;
    assert!(client.set("moving", "v").await.is_success());

    // a failed-over node swallows commands without answering
    let request = old_owner.route(Request::new(Opcode::Noop));
    old_owner.write(&request).await;
    assert!(old_owner.read_raw(100).await.is_empty());

    control.ok("RESPAWN", json!({"idx": owner})).await;
    assert!(common::bucket(&runtime).nodes()[owner].is_active());
}

#[tokio::test]
async fn regen_coords_changes_uuids() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let before = common::bucket(&runtime).map().uuids();
    control.ok("REGEN_VBCOORDS", json!({})).await;
    let after = common::bucket(&runtime).map().uuids();
    assert!(before.iter().zip(&after).all(|(a, b)| a != b));
}

#[tokio::test]
async fn mcports_lists_bound_ports() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let ports = control.ok("GET_MCPORTS", json!({})).await;
    let ports: Vec<u16> = serde_json::from_value(ports).unwrap();
    assert_eq!(ports, common::bucket(&runtime).ports());
    assert!(ports.iter().all(|&p| p != 0));
}

// ============================================================================
// Fault injection
// ============================================================================

#[tokio::test]
async fn opfail_forces_status() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let owner = common::owner_of(&runtime, "f");
    let mut client = Client::connect(&runtime, owner).await;

    control
        .ok("OPFAIL", json!({"code": 0x86, "count": 2, "servers": [owner]}))
        .await;
    assert_eq!(client.set("f", "v").await.status, ErrorCode::Etmpfail);
    assert_eq!(client.get("f").await.status, ErrorCode::Etmpfail);
    assert!(client.set("f", "v").await.is_success());

    control
        .ok("OPFAIL", json!({"code": 0x7ff0, "count": -1, "opcode": 0x00}))
        .await;
    assert_eq!(client.get("f").await.status, ErrorCode::DummyRetryConstant);
    assert!(client.set("f", "w").await.is_success());
    assert_eq!(client.get("f").await.status, ErrorCode::DummyRetryConstant);

    control.ok("OPFAIL", json!({"code": 0x86, "count": 0})).await;
    assert_eq!(client.get("f").await.value, "w");

    let reply = control.send("OPFAIL", json!({"code": 0x4242, "count": 1})).await;
    assert_eq!(reply["status"], "fail");
}

#[tokio::test]
async fn truncate_cuts_response_batch() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let mut client = Client::connect(&runtime, 0).await;

    control.ok("TRUNCATE", json!({"limit": 10, "idx": 0})).await;
    client.write(&Request::new(Opcode::Noop)).await;
    assert_eq!(client.read_raw(100).await.len(), 10);

    control.ok("TRUNCATE", json!({"limit": 0})).await;
    let response = client.call(Request::new(Opcode::Version)).await;
    assert_eq!(response.value, "9.9.9");
}

#[tokio::test]
async fn hiccup_delays_response_tail() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let mut client = Client::connect(&runtime, 0).await;

    control.ok("HICCUP", json!({"msecs": 150, "offset": 4, "idx": 0})).await;
    let started = Instant::now();
    let response = client.call(Request::new(Opcode::Noop)).await;
    assert!(response.is_success());
    assert!(started.elapsed() >= Duration::from_millis(150));

    let reply = control.send("HICCUP", json!({"msecs": -1})).await;
    assert_eq!(reply["status"], "fail");
}

#[tokio::test]
async fn cccp_toggle() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let mut client = Client::connect(&runtime, 0).await;

    control.ok("SET_CCCP", json!({"enabled": false})).await;
    let response = client.call(Request::new(Opcode::GetClusterConfig)).await;
    assert_eq!(response.status, ErrorCode::NotSupported);

    control.ok("SET_CCCP", json!({"enabled": true})).await;
    assert!(client.call(Request::new(Opcode::GetClusterConfig)).await.is_success());
}

#[tokio::test]
async fn command_log_records_opcodes() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let mut client = Client::connect(&runtime, 1).await;

    control.ok("START_CMDLOG", json!({"idx": 1})).await;
    client.call(Request::new(Opcode::Noop)).await;
    client.call(Request::new(Opcode::Version)).await;
    let log = control.ok("GET_CMDLOG", json!({"idx": 1})).await;
    let opcodes: Vec<u64> = log
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["opcode"].as_u64().unwrap())
        .collect();
    assert_eq!(opcodes, vec![0x0a, 0x0b]);

    control.ok("STOP_CMDLOG", json!({"idx": 1})).await;
    assert_eq!(control.send("GET_CMDLOG", json!({"idx": 1})).await["status"], "fail");
}

// ============================================================================
// Cache and persistence
// ============================================================================

#[tokio::test]
async fn keyinfo_tracks_cache_and_disk() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let mut client = Client::for_key(&runtime, "ki").await;
    let stored = client.set("ki", "v").await;

    let info = control.ok("KEYINFO", json!({"Key": "ki"})).await;
    let owner = common::owner_of(&runtime, "ki");
    assert_eq!(info[owner]["Conf"]["Type"], "master");
    assert_eq!(info[owner]["Cache"]["CAS"], stored.cas);
    assert_eq!(info[owner]["Disk"]["CAS"], stored.cas);

    control.ok("UNPERSIST", json!({"Key": "ki", "OnMaster": true})).await;
    let info = control.ok("KEYINFO", json!({"Key": "ki"})).await;
    assert_eq!(info[owner]["Disk"], json!({}));

    control
        .ok("UNCACHE", json!({"Key": "ki", "OnMaster": true, "OnReplicas": 1}))
        .await;
    assert_eq!(client.get("ki").await.status, ErrorCode::KeyEnoent);
}

#[tokio::test]
async fn disabled_persistence_is_visible_to_observe() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let mut client = Client::for_key(&runtime, "np").await;

    control.ok("SET_PERSIST", json!({"enabled": false})).await;
    client.set("np", "v").await;
    let info = control.ok("KEYINFO", json!({"Key": "np"})).await;
    let owner = common::owner_of(&runtime, "np");
    assert_eq!(info[owner]["Disk"], json!({}));

    control.ok("PERSIST", json!({"Key": "np", "OnMaster": true})).await;
    let info = control.ok("KEYINFO", json!({"Key": "np"})).await;
    assert_eq!(info[owner]["Disk"]["Value"], "v");
}

#[tokio::test]
async fn time_travel_expires_items() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let mut client = Client::for_key(&runtime, "ttl").await;

    let mut extras = vec![0u8; 4];
    extras.extend_from_slice(&10u32.to_be_bytes());
    let request = Request::new(Opcode::Set)
        .with_key("ttl")
        .with_extras(extras)
        .with_value("v");
    assert!(client.call(request).await.is_success());
    assert!(client.get("ttl").await.is_success());

    control.ok("TIME_TRAVEL", json!({"Offset": 11})).await;
    assert_eq!(client.get("ttl").await.status, ErrorCode::KeyEnoent);
}

#[tokio::test]
async fn unknown_command_fails() {
    let runtime = start(small_config()).await;
    let mut control = ControlClient::connect(&runtime).await;
    let reply = control.send("START_RETRY_VERIFY", json!({})).await;
    assert_eq!(reply["status"], "fail");
    assert!(reply["error"].as_str().unwrap().contains("unknown command"));
}
