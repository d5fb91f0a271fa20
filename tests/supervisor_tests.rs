//! Lifecycle tests: handshake, auth, reconnect, close and waiter policy on
//! teardown.

mod common;

use std::time::Duration;

use rmpv::Value;
use tarantool_client::{
    Call, Connection, ConnectionState, Error, Feature, ReconnectOptions, RequestOptions,
    RequestType,
};

use common::{FakeServer, Reply, ServerOptions};

fn ok_responder() -> impl Fn(&common::Recorded) -> Vec<Reply> + Send + Sync {
    |_| vec![Reply::Ok(Value::Array(vec![]))]
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_auth_scramble_and_order() {
    let server = FakeServer::spawn(
        ServerOptions {
            password: Some("sesame".to_string()),
            ..ServerOptions::default()
        },
        ok_responder(),
    )
    .await;

    let conn = Connection::builder()
        .auth("app", "sesame")
        .reconnect(ReconnectOptions::disabled())
        .build(server.addr())
        .await
        .expect("authenticated connect");
    conn.ping().await.expect("ping");

    let recorded = server.recorded();
    let auth_at = recorded
        .iter()
        .position(|r| r.is(RequestType::Auth))
        .expect("auth frame");
    let id_at = recorded
        .iter()
        .position(|r| r.is(RequestType::Id))
        .expect("id frame");
    assert!(auth_at < id_at, "AUTH must precede IPROTO_ID");

    // The fake server verified the scramble against the known salt; the
    // body shape is checked here.
    let auth = &recorded[auth_at];
    assert_eq!(
        auth.body_field(tarantool_client::protocol::consts::keys::USER_NAME)
            .unwrap()
            .as_str(),
        Some("app")
    );
    let tuple = auth
        .body_field(tarantool_client::protocol::consts::keys::TUPLE)
        .unwrap()
        .as_array()
        .unwrap();
    assert_eq!(tuple[0].as_str(), Some("chap-sha1"));
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let server = FakeServer::spawn(
        ServerOptions {
            password: Some("sesame".to_string()),
            ..ServerOptions::default()
        },
        ok_responder(),
    )
    .await;

    // Even with reconnects enabled, bad credentials must not retry.
    let err = Connection::builder()
        .auth("app", "wrong")
        .build(server.addr())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(_)), "{err:?}");
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_missing_required_feature_is_fatal() {
    let server = FakeServer::spawn(
        ServerOptions {
            features: vec![Feature::Streams],
            ..ServerOptions::default()
        },
        ok_responder(),
    )
    .await;

    let err = Connection::builder()
        .require_feature(Feature::Watchers)
        .build(server.addr())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)), "{err:?}");
}

#[tokio::test]
async fn test_unreachable_endpoint() {
    // Bind and immediately drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = Connection::builder()
        .reconnect(ReconnectOptions::disabled())
        .connect_timeout(Duration::from_secs(1))
        .build(&addr)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err:?}");
}

#[tokio::test]
async fn test_server_info_exposed() {
    let server = FakeServer::spawn(ServerOptions::default(), ok_responder()).await;
    let conn = Connection::builder()
        .build(server.addr())
        .await
        .expect("connect");

    let info = conn.server_info().expect("server info");
    assert_eq!(info.version, "3.1.0");
    assert_eq!(info.protocol_version, 6);
    assert!(info.supports(Feature::Watchers));
    assert!(info.names_supported());
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_reconnects_after_transport_loss() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Call) {
            vec![Reply::Drop]
        } else {
            vec![Reply::Ok(Value::Array(vec![]))]
        }
    })
    .await;

    let conn = Connection::builder()
        .build(server.addr())
        .await
        .expect("connect");
    conn.ping().await.expect("ping before failure");

    let err = conn.call("boom", &()).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed { .. }), "{err:?}");

    // The supervisor re-establishes the connection on its own; queued
    // work resumes once the new generation is ready.
    conn.ping().await.expect("ping after reconnect");
    assert!(server.connections() >= 2);
    assert_eq!(conn.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_waiter_policy_on_reconnect() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Call) {
            vec![Reply::Drop]
        } else {
            vec![Reply::Ok(Value::Array(vec![]))]
        }
    })
    .await;

    let conn = Connection::builder()
        .build(server.addr())
        .await
        .expect("connect");

    // Idempotent request: its death is flagged retryable.
    let err = conn
        .send_with(
            Call::new("boom", &()).unwrap(),
            RequestOptions::default().retry_safe(true),
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
    conn.ping().await.expect("reconnected");

    // Default: not retryable.
    let err = conn.call("boom", &()).await.unwrap_err();
    match err {
        Error::ConnectionClosed { retryable } => assert!(!retryable),
        other => panic!("unexpected error: {other:?}"),
    }
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn test_close_is_terminal() {
    let server = FakeServer::spawn(ServerOptions::default(), ok_responder()).await;
    let conn = Connection::builder()
        .build(server.addr())
        .await
        .expect("connect");

    conn.ping().await.expect("ping");
    conn.close().await.expect("close");
    assert_eq!(conn.state(), ConnectionState::Closed);

    let err = conn.ping().await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed { retryable: false }
    ));
}

#[tokio::test]
async fn test_abort_fails_pending_requests() {
    let server = FakeServer::spawn(ServerOptions::default(), |recorded| {
        if recorded.is(RequestType::Call) {
            // Leave the call in flight forever.
            vec![Reply::None]
        } else {
            vec![Reply::Ok(Value::Array(vec![]))]
        }
    })
    .await;

    let conn = Connection::builder()
        .build(server.addr())
        .await
        .expect("connect");

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call("hang", &()).await })
    };
    // Give the call time to hit the wire.
    tokio::time::sleep(Duration::from_millis(100)).await;

    conn.abort().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed { retryable: false }
    ));
    assert_eq!(conn.state(), ConnectionState::Closed);
}
