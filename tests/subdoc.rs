//! Sub-document integration tests.
//!
//! The path engine is exercised through its public API, and the multi-path
//! commands over a running node.

mod common;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cbmock::adapters::memcached::{Opcode, Request};
use cbmock::error::ErrorCode;
use cbmock::subdoc::path::MAX_DEPTH;
use cbmock::subdoc::{execute, Component, Operation, Path, SubdocError};
use common::{set, small_config, start, Client};
use serde_json::{json, Value};

/// Apply `op` and return the new document.
fn mutate(doc: &Value, path: &str, op: Operation, value: &str, mkdir_p: bool) -> Value {
    let text = serde_json::to_vec(doc).unwrap();
    execute(&text, path, op, Some(value.as_bytes()), mkdir_p)
        .unwrap()
        .document
        .unwrap()
}

fn lookup(doc: &Value, path: &str, op: Operation) -> Result<Option<Value>, SubdocError> {
    let text = serde_json::to_vec(doc).unwrap();
    execute(&text, path, op, None, false).map(|r| r.matched)
}

// ============================================================================
// Paths
// ============================================================================

#[test]
fn path_components() {
    let path = Path::parse("profile.emails[1].`x.y`").unwrap();
    assert_eq!(
        path.components(),
        &[
            Component::Key("profile".to_string()),
            Component::Key("emails".to_string()),
            Component::Index(1),
            Component::Key("x.y".to_string()),
        ]
    );
    assert!(Path::parse("").unwrap().is_empty());
    assert_eq!(Path::parse("[-1]").unwrap().last(), Some(&Component::Index(-1)));
}

#[test]
fn malformed_paths_are_invalid() {
    for bad in ["a[[0]]", "a]", "a[0", "a..b", "a.", "a[-2]", "a[x]", "a[]", "`open"] {
        assert_eq!(Path::parse(bad).unwrap_err(), SubdocError::PathInvalid, "{}", bad);
    }
}

#[test]
fn depth_limit() {
    let at_limit = vec!["k"; MAX_DEPTH].join(".");
    assert_eq!(Path::parse(&at_limit).unwrap().len(), MAX_DEPTH);

    let too_deep = vec!["k"; MAX_DEPTH + 1].join(".");
    let err = Path::parse(&too_deep).unwrap_err();
    assert_eq!(err, SubdocError::PathTooBig);
    assert_eq!(err.code(), ErrorCode::SubdocPathE2big);
}

// ============================================================================
// Building a document step by step
// ============================================================================

#[test]
fn document_edit_session() {
    let mut doc = json!({"name": "ann"});

    doc = mutate(&doc, "address.city", Operation::DictUpsert, "\"Oslo\"", true);
    doc = mutate(&doc, "tags", Operation::ArrayAppend, "\"a\",\"b\"", true);
    doc = mutate(&doc, "tags", Operation::ArrayPrepend, "\"first\"", false);
    doc = mutate(&doc, "tags[1]", Operation::ArrayInsert, "\"between\"", false);
    doc = mutate(&doc, "tags", Operation::AddUnique, "\"c\"", false);
    doc = mutate(&doc, "name", Operation::Replace, "\"bob\"", false);
    doc = mutate(&doc, "visits", Operation::Counter, "3", false);
    doc = mutate(&doc, "visits", Operation::Counter, "-1", false);

    assert_eq!(
        doc,
        json!({
            "name": "bob",
            "address": {"city": "Oslo"},
            "tags": ["first", "between", "a", "b", "c"],
            "visits": 2
        })
    );

    assert_eq!(lookup(&doc, "tags", Operation::GetCount).unwrap(), Some(json!(5)));
    assert_eq!(lookup(&doc, "tags[-1]", Operation::Get).unwrap(), Some(json!("c")));
    assert_eq!(lookup(&doc, "address.city", Operation::Exists).unwrap(), Some(json!("Oslo")));

    let text = serde_json::to_vec(&doc).unwrap();
    let removed = execute(&text, "address", Operation::Remove, None, false).unwrap();
    assert_eq!(removed.matched, Some(json!({"city": "Oslo"})));
    assert!(removed.document.unwrap().get("address").is_none());
}

#[test]
fn escaped_keys() {
    let doc = json!({"a.b": {"c": 1}, "x`y": 2});
    assert_eq!(lookup(&doc, "`a.b`.c", Operation::Get).unwrap(), Some(json!(1)));
    assert_eq!(lookup(&doc, "`x``y`", Operation::Get).unwrap(), Some(json!(2)));
    assert_eq!(lookup(&doc, "a.b", Operation::Get), Err(SubdocError::PathNotFound));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn structural_failures() {
    let doc = json!({"n": 1, "list": [1, 2], "obj": {}});

    assert_eq!(lookup(&doc, "n.inner", Operation::Get), Err(SubdocError::PathMismatch));
    assert_eq!(lookup(&doc, "n", Operation::GetCount), Err(SubdocError::PathMismatch));
    assert_eq!(lookup(&doc, "list[7]", Operation::Get), Err(SubdocError::PathNotFound));

    let text = serde_json::to_vec(&doc).unwrap();
    let run = |path: &str, op: Operation, value: &str, mkdir_p: bool| {
        execute(&text, path, op, Some(value.as_bytes()), mkdir_p).map(|_| ())
    };
    assert_eq!(run("n", Operation::DictAdd, "2", false), Err(SubdocError::PathExists));
    assert_eq!(run("missing.deep", Operation::DictAdd, "2", false), Err(SubdocError::PathNotFound));
    assert_eq!(run("obj", Operation::ArrayAppend, "1", false), Err(SubdocError::PathMismatch));
    assert_eq!(run("list", Operation::AddUnique, "2", false), Err(SubdocError::PathExists));
    assert_eq!(run("n", Operation::Replace, "not json", false), Err(SubdocError::CannotInsert));
    assert_eq!(run("obj", Operation::Counter, "1", false), Err(SubdocError::PathMismatch));
    assert_eq!(run("n", Operation::Counter, "0", false), Err(SubdocError::DeltaRange));
    assert_eq!(run("n", Operation::Counter, "1.5", false), Err(SubdocError::DeltaRange));

    assert_eq!(
        execute(b"not json", "a", Operation::Get, None, false).unwrap_err(),
        SubdocError::DocNotJson
    );
}

#[test]
fn counter_overflow() {
    let near = json!({ "c": i64::MAX - 1 });
    let text = serde_json::to_vec(&near).unwrap();
    assert_eq!(
        execute(&text, "c", Operation::Counter, Some(b"5"), false).unwrap_err(),
        SubdocError::DeltaRange
    );

    let big = br#"{"c":18446744073709551615}"#;
    assert_eq!(
        execute(big, "c", Operation::Counter, Some(b"1"), false).unwrap_err(),
        SubdocError::NumberTooBig
    );
}

#[test]
fn errors_map_to_wire_status() {
    let cases = [
        (SubdocError::PathNotFound, ErrorCode::SubdocPathEnoent),
        (SubdocError::PathExists, ErrorCode::SubdocPathEexists),
        (SubdocError::PathMismatch, ErrorCode::SubdocPathMismatch),
        (SubdocError::PathInvalid, ErrorCode::SubdocPathEinval),
        (SubdocError::DocNotJson, ErrorCode::SubdocDocNotJson),
        (SubdocError::NumberTooBig, ErrorCode::SubdocNumErange),
        (SubdocError::DeltaRange, ErrorCode::SubdocDeltaErange),
        (SubdocError::CannotInsert, ErrorCode::SubdocValueCantinsert),
    ];
    for (err, code) in cases {
        assert_eq!(ErrorCode::from(err), code, "{}", err);
    }
}

#[test]
fn opcodes_and_root_types() {
    assert_eq!(Operation::from_opcode(Opcode::SubdocCounter as u8), Some(Operation::Counter));
    assert_eq!(Operation::from_opcode(Opcode::SubdocMultiLookup as u8), None);
    assert_eq!(Operation::ArrayAppend.root_type(""), Some("[]"));
    assert_eq!(Operation::DictUpsert.root_type(""), None);
    assert_eq!(Operation::DictUpsert.root_type("[0]"), Some("[]"));
    assert_eq!(Operation::DictUpsert.root_type("a.b"), Some("{}"));
}

// ============================================================================
// Multi-path over the wire
// ============================================================================

fn lookup_specs(specs: &[(Opcode, &str)]) -> Bytes {
    let mut body = BytesMut::new();
    for (opcode, path) in specs {
        body.put_u8(*opcode as u8);
        body.put_u8(0);
        body.put_u16(path.len() as u16);
        body.put_slice(path.as_bytes());
    }
    body.freeze()
}

fn mutation_specs(specs: &[(Opcode, &str, &str)]) -> Bytes {
    let mut body = BytesMut::new();
    for (opcode, path, value) in specs {
        body.put_u8(*opcode as u8);
        body.put_u8(0);
        body.put_u16(path.len() as u16);
        body.put_u32(value.len() as u32);
        body.put_slice(path.as_bytes());
        body.put_slice(value.as_bytes());
    }
    body.freeze()
}

#[tokio::test]
async fn multi_lookup_reports_each_path() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "ml").await;
    client.call(set("ml", r#"{"a":1,"b":[1,2]}"#)).await;

    let body = lookup_specs(&[
        (Opcode::SubdocGet, "a"),
        (Opcode::SubdocExists, "zz"),
        (Opcode::SubdocGetCount, "b"),
    ]);
    let response = client
        .call(Request::new(Opcode::SubdocMultiLookup).with_key("ml").with_value(body))
        .await;
    assert_eq!(response.status, ErrorCode::SubdocMultiPathFailure);

    let mut value = response.value.clone();
    let mut results = Vec::new();
    while value.has_remaining() {
        let status = value.get_u16();
        let len = value.get_u32() as usize;
        results.push((status, value.split_to(len)));
    }
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], (0, Bytes::from_static(b"1")));
    assert_eq!(results[1].0, ErrorCode::SubdocPathEnoent.code());
    assert_eq!(results[2], (0, Bytes::from_static(b"2")));
}

#[tokio::test]
async fn multi_mutation_is_atomic() {
    let runtime = start(small_config()).await;
    let mut client = Client::for_key(&runtime, "mm").await;
    let stored = client.call(set("mm", r#"{"n":1}"#)).await;

    let body = mutation_specs(&[
        (Opcode::SubdocDictUpsert, "x", "true"),
        (Opcode::SubdocCounter, "n", "4"),
    ]);
    let response = client
        .call(Request::new(Opcode::SubdocMultiMutation).with_key("mm").with_value(body))
        .await;
    assert!(response.is_success());
    assert!(response.cas > stored.cas);
    // only the counter returns a value
    let mut value = response.value.clone();
    assert_eq!(value.get_u8(), 1);
    assert_eq!(value.get_u16(), 0);
    let len = value.get_u32() as usize;
    assert_eq!(&value[..len], b"5");

    let body = mutation_specs(&[
        (Opcode::SubdocDictUpsert, "y", "1"),
        (Opcode::SubdocDictAdd, "n", "0"),
    ]);
    let failed = client
        .call(Request::new(Opcode::SubdocMultiMutation).with_key("mm").with_value(body))
        .await;
    assert_eq!(failed.status, ErrorCode::SubdocMultiPathFailure);
    let mut value = failed.value.clone();
    assert_eq!(value.get_u8(), 1);
    assert_eq!(value.get_u16(), ErrorCode::SubdocPathEexists.code());

    let doc: Value = serde_json::from_slice(&client.get("mm").await.value).unwrap();
    assert_eq!(doc, json!({"n": 5, "x": true}));
}
