// tests/integration/lifecycle_test.rs

//! Integration tests for connection registration, teardown and shutdown.

use super::test_helpers::{RecordingHooks, TestPair, eventually, node_with_raw_peer};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use peerlink::CallOptions;
use peerlink::connection::PeerInfo;
use peerlink::core::errors::{CallError, PeerLinkError};
use peerlink::core::hooks::CloseReason;
use peerlink::core::protocol::{ExecStatus, Frame, FrameCodec, Query};
use peerlink::core::tasks::pinger::PingerTask;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Encoder, FramedRead};

#[tokio::test]
async fn test_duplicate_key_is_refused() {
    let pair = TestPair::new().await;
    let (left, _right) = tokio::io::duplex(1024);
    let err = pair.a.attach("b", left, PeerInfo::default()).unwrap_err();
    assert_eq!(err, PeerLinkError::KeyExists("b".to_string()));
    assert_eq!(pair.a.registry().len(), 1);
}

#[tokio::test]
async fn test_disconnect_wakes_waiting_callers() {
    let hooks = RecordingHooks::default();
    let (node, raw) = node_with_raw_peer(hooks.clone()).await;

    let caller = node.caller();
    let call = tokio::spawn(async move {
        caller
            .call("raw", "anything", &Value::Null, &CallOptions::default())
            .await
    });
    let watched = Arc::clone(&node);
    eventually(move || {
        watched
            .registry()
            .open("raw")
            .is_some_and(|conn| conn.correlation_stats().pending == 1)
    })
    .await;

    drop(raw);
    assert_eq!(call.await.unwrap().unwrap_err(), CallError::ConnectionLost);

    let registry = Arc::clone(node.registry());
    eventually(move || registry.is_empty()).await;
    assert_eq!(
        hooks.closed_reasons(),
        vec![("raw".to_string(), CloseReason::PeerClosed)]
    );
}

#[tokio::test]
async fn test_shutdown_frame_closes_the_connection() {
    let hooks = RecordingHooks::default();
    let (node, mut raw) = node_with_raw_peer(hooks.clone()).await;

    raw.write_all(&[0]).await.unwrap();

    let registry = Arc::clone(node.registry());
    eventually(move || registry.is_empty()).await;
    assert_eq!(
        hooks.closed_reasons(),
        vec![("raw".to_string(), CloseReason::PeerShutdown)]
    );
}

#[tokio::test]
async fn test_garbage_is_a_protocol_error() {
    let hooks = RecordingHooks::default();
    let (node, mut raw) = node_with_raw_peer(hooks.clone()).await;

    raw.write_all(b"Zzzz").await.unwrap();

    let registry = Arc::clone(node.registry());
    eventually(move || registry.is_empty()).await;
    let closed = hooks.closed_reasons();
    assert_eq!(closed.len(), 1);
    assert!(matches!(closed[0].1, CloseReason::InvalidProtocol(_)));
}

#[tokio::test]
async fn test_raw_query_gets_an_answer() {
    let (_node, raw) = node_with_raw_peer(RecordingHooks::default()).await;
    let (read_half, mut write_half) = tokio::io::split(raw);

    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(
            Frame::Query(Query {
                request_id: 9,
                method: "echo".to_string(),
                payload: Bytes::from_static(br#"{"x":1}"#),
                auth_token: None,
            }),
            &mut buf,
        )
        .unwrap();
    write_half.write_all(&buf).await.unwrap();

    let mut frames = FramedRead::new(read_half, FrameCodec::default());
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        Frame::Answer(answer) => {
            assert_eq!(answer.request_id, 9);
            assert_eq!(answer.status, ExecStatus::Success);
            let payload: Value = serde_json::from_slice(&answer.payload).unwrap();
            assert_eq!(payload, json!({"x": 1}));
        }
        other => panic!("expected an answer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_node_shutdown_notifies_peers() {
    let pair = TestPair::new().await;

    pair.a.shutdown().await;
    assert!(pair.a.registry().is_empty());
    assert_eq!(
        pair.a_hooks.closed_reasons(),
        vec![("b".to_string(), CloseReason::LocalShutdown)]
    );

    let registry = Arc::clone(pair.b.registry());
    eventually(move || registry.is_empty()).await;
    assert_eq!(
        pair.b_hooks.closed_reasons(),
        vec![("a".to_string(), CloseReason::PeerShutdown)]
    );

    // A finishing node accepts no new connections.
    let (left, _right) = tokio::io::duplex(1024);
    let err = pair.a.attach("c", left, PeerInfo::default()).unwrap_err();
    assert_eq!(err, PeerLinkError::Terminated("c".to_string()));
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_tasks() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let call = tokio::spawn(async move {
        caller
            .call("b", "wait_for_gate", &json!("done"), &CallOptions::default())
            .await
    });
    let b_registry = Arc::clone(pair.b.registry());
    let a_node = Arc::clone(&pair.a);
    eventually(move || {
        a_node
            .registry()
            .open("b")
            .is_some_and(|conn| conn.correlation_stats().pending == 1)
    })
    .await;

    let b = Arc::clone(&pair.b);
    let shutdown = tokio::spawn(async move { b.shutdown().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Still draining: the connection stays registered.
    assert_eq!(b_registry.len(), 1);

    // The shutdown frame reached `a` first, so its caller gave up.
    assert_eq!(call.await.unwrap().unwrap_err(), CallError::ConnectionLost);

    pair.gate.notify_one();
    shutdown.await.unwrap();
    assert!(b_registry.is_empty());
}

#[tokio::test]
async fn test_pinger_counts_healthy_peers() {
    let pair = TestPair::new().await;
    let pinger = PingerTask::new(Arc::clone(pair.a.state()), Duration::from_secs(1));
    assert_eq!(pinger.ping_all().await, 1);
    // The ping method is not reported as missing.
    assert_eq!(
        pair.b_hooks
            .methods_not_found
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = super::test_helpers::test_config("node-small");
    config.max_connections = 1;
    let node = peerlink::PeerNode::builder(config).build();

    let (first, _keep_first) = tokio::io::duplex(1024);
    node.attach("one", first, PeerInfo::default()).unwrap();
    let (second, _keep_second) = tokio::io::duplex(1024);
    let err = node.attach("two", second, PeerInfo::default()).unwrap_err();
    assert!(matches!(err, PeerLinkError::Internal(_)));
}

#[tokio::test]
async fn test_pinger_stops_on_shutdown() {
    let pair = TestPair::new().await;
    let state = Arc::clone(pair.a.state());
    let pinger = PingerTask::new(Arc::clone(&state), Duration::from_secs(3600));
    let task = tokio::spawn(pinger.run(state.shutdown_tx.subscribe()));

    state.begin_shutdown();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("pinger exits once shutdown is signalled")
        .unwrap();

    // The connection is still registered, yet a finishing node pings nobody.
    assert_eq!(pair.a.registry().len(), 1);
    let late = PingerTask::new(Arc::clone(&state), Duration::from_secs(1));
    assert_eq!(late.ping_all().await, 0);
    assert!(pair.a_stats().is_empty());
}

#[tokio::test]
async fn test_node_shutdown_stops_a_started_pinger() {
    let mut config = super::test_helpers::test_config("node-pinging");
    config.rpc.ping_interval_secs = 1;
    let node = peerlink::PeerNode::builder(config).build();
    assert!(node.start_pinger());

    tokio::time::timeout(Duration::from_secs(2), node.shutdown())
        .await
        .expect("shutdown does not wait on the pinger period");
}
