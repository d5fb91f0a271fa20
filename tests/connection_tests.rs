//! End-to-end connection engine tests against the fake server.
//!
//! Covers request/response multiplexing, body encoding on the wire,
//! server errors, deadlines and unsolicited frames.

mod common;

use std::time::{Duration, Instant};

use rmpv::Value;
use tarantool_client::protocol::consts::keys;
use tarantool_client::{
    Call, Connection, Error, ReconnectOptions, RequestOptions, RequestType, Select, Update,
    UpdateOps,
};

use common::{FakeServer, Reply, ServerOptions};

async fn connect(server: &FakeServer) -> Connection {
    Connection::builder()
        .reconnect(ReconnectOptions::disabled())
        .build(server.addr())
        .await
        .expect("connect")
}

// ============================================================================
// Ping
// ============================================================================

#[tokio::test]
async fn test_ping_round_trip() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Ping) {
            vec![Reply::Ok(Value::Array(vec![]))]
        } else {
            vec![Reply::OkEmpty]
        }
    })
    .await;

    let conn = connect(&server).await;
    conn.ping().await.expect("ping");

    let pings: Vec<_> = server
        .recorded()
        .into_iter()
        .filter(|r| r.is(RequestType::Ping))
        .collect();
    assert_eq!(pings.len(), 1);
    assert!(pings[0].sync > 0);
    assert!(pings[0].body.is_empty());
    assert_eq!(pings[0].stream_id, None);
}

#[tokio::test]
async fn test_pipelined_requests_all_complete() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        vec![Reply::Ok(Value::Array(vec![Value::from(recorded.sync)]))]
    })
    .await;

    let conn = connect(&server).await;
    let mut handles = Vec::new();
    for _ in 0..16 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move { conn.ping().await }));
    }
    for handle in handles {
        handle.await.unwrap().expect("pipelined ping");
    }

    let pings = server
        .recorded()
        .into_iter()
        .filter(|r| r.is(RequestType::Ping))
        .count();
    assert_eq!(pings, 16);
}

// ============================================================================
// Body encoding on the wire
// ============================================================================

#[tokio::test]
async fn test_select_by_name_body() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Select) {
            vec![Reply::Ok(Value::Array(vec![Value::Array(vec![
                Value::from(1),
                Value::from("a"),
            ])]))]
        } else {
            vec![Reply::OkEmpty]
        }
    })
    .await;

    let conn = connect(&server).await;
    let response = conn
        .send(Select::new("test").index("primary").key(&(1,)).unwrap())
        .await
        .expect("select");
    let rows: Vec<(u64, String)> = response.decode_data().unwrap();
    assert_eq!(rows, vec![(1, "a".to_string())]);

    let select = server
        .recorded()
        .into_iter()
        .find(|r| r.is(RequestType::Select))
        .expect("select frame");
    assert_eq!(
        select.body_field(keys::SPACE_NAME).unwrap().as_str(),
        Some("test")
    );
    assert_eq!(
        select.body_field(keys::INDEX_NAME).unwrap().as_str(),
        Some("primary")
    );
    assert_eq!(select.body_field(keys::ITERATOR).unwrap().as_u64(), Some(0));
    assert_eq!(select.body_field(keys::OFFSET).unwrap().as_u64(), Some(0));
    assert_eq!(
        select.body_field(keys::LIMIT).unwrap().as_u64(),
        Some(u64::from(u32::MAX))
    );
    assert_eq!(
        select.body_field(keys::KEY).unwrap(),
        &Value::Array(vec![Value::from(1)])
    );
}

#[tokio::test]
async fn test_update_ops_echo() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Update) {
            vec![Reply::Ok(Value::Array(vec![Value::Array(vec![
                Value::from(42),
                Value::from(2),
                Value::from("x"),
            ])]))]
        } else {
            vec![Reply::OkEmpty]
        }
    })
    .await;

    let conn = connect(&server).await;
    let ops = UpdateOps::new()
        .add(2, &1)
        .unwrap()
        .assign(3, &"x")
        .unwrap();
    let response = conn
        .send(Update::new(512u32, ops).key(&(42,)).unwrap())
        .await
        .expect("update");
    let rows: Vec<(u64, u64, String)> = response.decode_data().unwrap();
    assert_eq!(rows, vec![(42, 2, "x".to_string())]);

    let update = server
        .recorded()
        .into_iter()
        .find(|r| r.is(RequestType::Update))
        .expect("update frame");
    assert_eq!(
        update.body_field(keys::SPACE_ID).unwrap().as_u64(),
        Some(512)
    );
    let ops = update
        .body_field(keys::TUPLE)
        .unwrap()
        .as_array()
        .expect("ops array");
    assert_eq!(
        ops[0],
        Value::Array(vec![Value::from("+"), Value::from(2), Value::from(1)])
    );
    assert_eq!(
        ops[1],
        Value::Array(vec![Value::from("="), Value::from(3), Value::from("x")])
    );
}

// ============================================================================
// Errors, deadlines, unsolicited frames
// ============================================================================

#[tokio::test]
async fn test_server_error_reaches_caller_only() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Call) {
            vec![Reply::Error {
                code: 3,
                message: "Duplicate key exists".to_string(),
            }]
        } else {
            vec![Reply::Ok(Value::Array(vec![]))]
        }
    })
    .await;

    let conn = connect(&server).await;
    let err = conn.call("explode", &()).await.unwrap_err();
    match err {
        Error::Server(server_err) => {
            assert_eq!(server_err.code, 3);
            assert_eq!(server_err.message, "Duplicate key exists");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // A server-side error must not affect connection state.
    conn.ping().await.expect("ping after server error");
}

#[tokio::test]
async fn test_request_timeout_and_late_reply_discarded() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Call) {
            // Never answer; the caller's deadline has to fire.
            vec![Reply::None]
        } else {
            vec![Reply::Ok(Value::Array(vec![]))]
        }
    })
    .await;

    let conn = connect(&server).await;
    let started = Instant::now();
    let err = conn
        .send_with(
            Call::new("slow", &()).unwrap(),
            RequestOptions::default().timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(140), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    // The connection survives an expired waiter.
    conn.ping().await.expect("ping after timeout");
}

#[tokio::test]
async fn test_unsolicited_response_is_ignored() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Ping) {
            vec![
                // Bogus frame nobody asked for, then the real answer.
                Reply::OkWithSync {
                    sync: recorded.sync + 5000,
                    data: Value::Array(vec![]),
                },
                Reply::Ok(Value::Array(vec![])),
            ]
        } else {
            vec![Reply::OkEmpty]
        }
    })
    .await;

    let conn = connect(&server).await;
    conn.ping().await.expect("first ping");
    conn.ping().await.expect("second ping");
}

#[tokio::test]
async fn test_cancelled_request_leaves_connection_usable() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Call) {
            vec![Reply::None]
        } else {
            vec![Reply::Ok(Value::Array(vec![]))]
        }
    })
    .await;

    let conn = connect(&server).await;
    {
        let conn = conn.clone();
        let pending = tokio::spawn(async move { conn.call("slow", &()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pending.abort();
        let _ = pending.await;
    }

    conn.ping().await.expect("ping after cancellation");
}
