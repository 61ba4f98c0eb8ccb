// tests/integration/rpc_test.rs

//! End-to-end calls between two nodes joined by an in-memory stream.

use super::test_helpers::{RejectingPool, SpawningPool, TestPair, eventually, stats};
use async_trait::async_trait;
use bytes::Bytes;
use peerlink::CallOptions;
use peerlink::connection::Session;
use peerlink::core::errors::CallError;
use peerlink::core::methods::{MethodContext, MethodError, MethodsHandler, Requirement};
use peerlink::core::protocol::{Answer, ExecStatus, Frame};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_echo_round_trip() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();

    let answer = caller
        .call("b", "echo", &json!({"x": 1}), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(answer, json!({"x": 1}));
    assert!(pair.a_stats().is_empty());
}

#[tokio::test]
async fn test_calls_work_in_both_directions() {
    let pair = TestPair::new().await;
    let from_a = pair
        .a
        .caller()
        .call("b", "echo", &json!("to b"), &CallOptions::default())
        .await
        .unwrap();
    let from_b = pair
        .b
        .caller()
        .call("a", "echo", &json!("to a"), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(from_a, json!("to b"));
    assert_eq!(from_b, json!("to a"));
}

#[tokio::test]
async fn test_null_payload_travels_as_null() {
    let pair = TestPair::new().await;
    let answer = pair
        .a
        .caller()
        .call("b", "echo", &Value::Null, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(answer, Value::Null);
}

#[tokio::test]
async fn test_concurrent_calls_are_answered_independently() {
    let pair = TestPair::with(|a| a, |b| b.pool(SpawningPool)).await;
    let caller = pair.a.caller();

    let slow_caller = caller.clone();
    let slow = tokio::spawn(async move {
        slow_caller
            .call("b", "wait_for_gate", &json!("slow"), &CallOptions::default())
            .await
    });
    eventually(|| pair.a_stats().pending == 1).await;

    // The second call completes while the first is still parked on the gate.
    let fast = caller
        .call("b", "echo", &json!("fast"), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(fast, json!("fast"));
    assert_eq!(pair.a_stats().pending, 1);

    pair.gate.notify_one();
    assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
    assert!(pair.a_stats().is_empty());
}

#[tokio::test]
async fn test_unknown_answer_is_discarded() {
    let pair = TestPair::new().await;

    // `b` answers a request `a` never issued.
    let b_side = pair.b.registry().open("a").unwrap();
    b_side
        .write_frame(Frame::Answer(Answer {
            request_id: 424_242,
            status: ExecStatus::Success,
            payload: Bytes::from_static(b"{}"),
        }))
        .await
        .unwrap();
    drop(b_side);

    let hooks = pair.a_hooks.clone();
    eventually(|| hooks.unexpected_answers.load(Ordering::SeqCst) == 1).await;
    assert!(pair.a_stats().is_empty());

    // The connection keeps working.
    let answer = pair
        .a
        .caller()
        .call("b", "echo", &json!(7), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(answer, json!(7));
}

#[tokio::test]
async fn test_timeout_forgets_the_request() {
    let pair = TestPair::new().await;
    let err = pair
        .a
        .caller()
        .call(
            "b",
            "hang",
            &Value::Null,
            &CallOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Timeout(Duration::from_millis(100)));
    assert!(pair.a_stats().is_empty());
}

/// Counts invocations and accepts every method.
#[derive(Clone, Default)]
struct CountingMethods {
    invoked: Arc<AtomicUsize>,
}

#[async_trait]
impl MethodsHandler for CountingMethods {
    fn requires_session(&self, _method: &str) -> bool {
        false
    }

    fn validate_requirements(&self, _session: Option<&Session>, _method: &str) -> Requirement {
        Requirement::Ok
    }

    async fn invoke(
        &self,
        _ctx: MethodContext,
        _method: &str,
        payload: Value,
    ) -> Result<Value, MethodError> {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    }
}

#[tokio::test]
async fn test_queue_overflow_is_answered_without_running() {
    let methods = CountingMethods::default();
    let invoked = Arc::clone(&methods.invoked);
    let pair = TestPair::with(|a| a, move |b| b.pool(RejectingPool).methods(methods)).await;

    let err = pair
        .a
        .caller()
        .call("b", "echo", &json!(1), &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::RemoteQueueOverflow);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(pair.b_hooks.queue_full.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reserved_prefix_is_refused_locally() {
    let pair = TestPair::new().await;
    let err = pair
        .a
        .caller()
        .call("b", "SESSION.LOGIN", &Value::Null, &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::ReservedMethod(_)));
    assert!(pair.a_stats().is_empty());
}

#[tokio::test]
async fn test_unknown_methods() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();

    let err = caller
        .call("b", "missing", &Value::Null, &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::MethodNotFound);
    assert_eq!(pair.b_hooks.methods_not_found.load(Ordering::SeqCst), 1);

    let err = caller
        .call("b", "SESSION.NOPE", &Value::Null, &CallOptions::session())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::MethodNotFound);
}

#[tokio::test]
async fn test_method_failures_are_classified() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();

    let err = caller
        .call("b", "fail", &json!({"code": 3}), &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Application(json!({"code": 3})));

    let err = caller
        .call("b", "panic", &Value::Null, &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::RemoteInternal(_)));

    // A panicking method does not take the connection down.
    let answer = caller
        .call("b", "echo", &json!("still up"), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(answer, json!("still up"));
}

#[tokio::test]
async fn test_unknown_key_is_not_connected() {
    let pair = TestPair::new().await;
    let err = pair
        .a
        .caller()
        .call("nobody", "echo", &Value::Null, &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, CallError::NotConnected("nobody".to_string()));
}

#[tokio::test]
async fn test_retry_waits_for_the_connection() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let late = Arc::clone(&pair.a);

    let call = tokio::spawn(async move {
        caller
            .call("late", "echo", &json!("hi"), &CallOptions::default().with_retry())
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let (left, right) = tokio::io::duplex(64 * 1024);
    late.attach("late", left, Default::default()).unwrap();
    pair.b.attach("late-a", right, Default::default()).unwrap();

    assert_eq!(call.await.unwrap().unwrap(), json!("hi"));
}

#[tokio::test]
async fn test_oversized_payload_is_refused_before_sending() {
    let pair = TestPair::new().await;
    let big = json!("x".repeat(17 * 1024 * 1024));
    let err = pair
        .a
        .caller()
        .call("b", "echo", &big, &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::PayloadTooLarge { .. }));
    assert!(stats(&pair.a, "b").is_empty());
}

#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Job {
    id: u32,
    name: String,
}

#[tokio::test]
async fn test_typed_calls() {
    let pair = TestPair::new().await;
    let caller = pair.a.caller();
    let job = Job {
        id: 3,
        name: "reindex".to_string(),
    };

    let echoed: Job = caller
        .call_json("b", "echo", &job, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(echoed, job);

    // An answer of the wrong shape is a local decoding failure.
    let err = caller
        .call_json::<_, Job>("b", "echo", "not a job", &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Serialization(_)));
}

#[tokio::test]
async fn test_answers_refresh_connection_activity() {
    let pair = TestPair::new().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let idle_before = pair.a.registry().open("b").unwrap().idle_for();
    assert!(idle_before >= Duration::from_millis(200));

    pair.a
        .caller()
        .call("b", "echo", &Value::Null, &CallOptions::default())
        .await
        .unwrap();
    let idle_after = pair.a.registry().open("b").unwrap().idle_for();
    assert!(idle_after < idle_before);
}
