// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink::config::Config;
use peerlink::connection::{CorrelationStats, PeerInfo};
use peerlink::core::auth::{TokenClaims, issue_token};
use peerlink::core::dispatch::TaskPool;
use peerlink::core::dispatch::pool::Job;
use peerlink::core::hooks::{CloseReason, RpcHooks};
use peerlink::core::methods::{MethodContext, MethodError, MethodRegistry};
use peerlink::core::protocol::ExecStatus;
use peerlink::server::builtin_methods;
use peerlink::{PeerNode, PeerNodeBuilder};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

pub const TOKEN_SECRET: &str = "integration-secret";

/// Sets up minimal tracing for tests. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// A configuration suited to tests: no pinger, short timeouts, a token secret.
pub fn test_config(node_name: &str) -> Config {
    let mut config = Config::default();
    config.node_name = node_name.to_string();
    config.rpc.ping_interval_secs = 0;
    config.rpc.remote_exec_timeout_ms = 2_000;
    config.rpc.retry_backoff_ms = 20;
    config.pool.workers = 2;
    config.pool.queue_capacity = 16;
    config.auth.token_secret = Some(TOKEN_SECRET.to_string());
    config
}

/// Signs a token for `user` in `domain`, valid for an hour.
pub fn token_for(user: &str, domain: &str, impersonator: Option<&str>) -> String {
    let claims = TokenClaims {
        user: user.to_string(),
        domain: Some(domain.to_string()),
        impersonator: impersonator.map(str::to_string),
        exp: chrono::Utc::now().timestamp() + 3600,
        sso: Some(json!({ "groups": ["ops"] })),
    };
    issue_token(TOKEN_SECRET.as_bytes(), &claims).unwrap()
}

/// The built-in methods plus a few used to steer timing in tests.
pub fn test_methods(gate: Arc<Notify>) -> MethodRegistry {
    let mut methods = builtin_methods();
    methods
        .register("wait_for_gate", move |_ctx: MethodContext, payload: Value| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(payload)
            }
        })
        .register("hang", |_ctx: MethodContext, _payload: Value| async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        })
        .register_with_session("revoke_session", |ctx: MethodContext, _payload: Value| async move {
            match ctx.session {
                Some(session) => {
                    session.revoke();
                    Ok(json!({ "revoked": session.user() }))
                }
                None => Err(MethodError::Failed(json!({ "reason": "no_session" }))),
            }
        })
        .register("fail", |_ctx: MethodContext, payload: Value| async move {
            Err(MethodError::Failed(payload))
        })
        .register("panic", |_ctx: MethodContext, _payload: Value| async move {
            if true {
                panic!("boom");
            }
            Ok(Value::Null)
        });
    methods
}

/// Records every hook invocation.
#[derive(Clone, Default)]
pub struct RecordingHooks {
    pub unexpected_answers: Arc<AtomicUsize>,
    pub queue_full: Arc<AtomicUsize>,
    pub methods_not_found: Arc<AtomicUsize>,
    pub closed: Arc<Mutex<Vec<(String, CloseReason)>>>,
}

impl RecordingHooks {
    pub fn closed_reasons(&self) -> Vec<(String, CloseReason)> {
        self.closed.lock().clone()
    }
}

impl RpcHooks for RecordingHooks {
    fn on_unexpected_answer(&self, _key: &str, _request_id: u64, _status: ExecStatus) {
        self.unexpected_answers.fetch_add(1, Ordering::SeqCst);
    }

    fn on_method_not_found(&self, _key: &str, _method: &str) {
        self.methods_not_found.fetch_add(1, Ordering::SeqCst);
    }

    fn on_queue_full(&self, _key: &str, _method: &str) {
        self.queue_full.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_closed(&self, key: &str, reason: &CloseReason) {
        self.closed.lock().push((key.to_string(), reason.clone()));
    }
}

/// A pool that refuses every job.
pub struct RejectingPool;

#[async_trait]
impl TaskPool for RejectingPool {
    async fn push_task(&self, _job: Job, _timeout: Duration, _priority: f64, _key: &str) -> bool {
        false
    }
}

/// A pool that runs every job on its own task.
pub struct SpawningPool;

#[async_trait]
impl TaskPool for SpawningPool {
    async fn push_task(&self, job: Job, _timeout: Duration, _priority: f64, _key: &str) -> bool {
        tokio::spawn(job);
        true
    }
}

/// Two nodes joined by an in-memory stream. `a` knows `b` as "b" and `b`
/// knows `a` as "a".
pub struct TestPair {
    pub a: Arc<PeerNode>,
    pub b: Arc<PeerNode>,
    pub gate: Arc<Notify>,
    pub a_hooks: RecordingHooks,
    pub b_hooks: RecordingHooks,
}

impl TestPair {
    pub async fn new() -> Self {
        Self::with(|builder| builder, |builder| builder).await
    }

    /// Builds a pair, letting the caller adjust either builder.
    pub async fn with(
        tweak_a: impl FnOnce(PeerNodeBuilder) -> PeerNodeBuilder,
        tweak_b: impl FnOnce(PeerNodeBuilder) -> PeerNodeBuilder,
    ) -> Self {
        init_tracing();
        let gate = Arc::new(Notify::new());
        let a_hooks = RecordingHooks::default();
        let b_hooks = RecordingHooks::default();

        let a = tweak_a(
            PeerNode::builder(test_config("node-a"))
                .methods(test_methods(Arc::clone(&gate)))
                .hooks(a_hooks.clone()),
        )
        .build();
        let b = tweak_b(
            PeerNode::builder(test_config("node-b"))
                .methods(test_methods(Arc::clone(&gate)))
                .hooks(b_hooks.clone()),
        )
        .build();

        let (left, right) = tokio::io::duplex(64 * 1024);
        a.attach("b", left, PeerInfo::default()).unwrap();
        b.attach("a", right, PeerInfo::default()).unwrap();

        Self {
            a: Arc::new(a),
            b: Arc::new(b),
            gate,
            a_hooks,
            b_hooks,
        }
    }

    /// The correlation state of `a`'s connection to `b`.
    pub fn a_stats(&self) -> CorrelationStats {
        stats(&self.a, "b")
    }
}

pub fn stats(node: &PeerNode, key: &str) -> CorrelationStats {
    let conn = node.registry().open(key).expect("connection is registered");
    conn.correlation_stats()
}

/// A node whose single connection "raw" ends in a stream the test drives.
pub async fn node_with_raw_peer(hooks: RecordingHooks) -> (Arc<PeerNode>, DuplexStream) {
    init_tracing();
    let node = PeerNode::builder(test_config("node-raw"))
        .methods(test_methods(Arc::new(Notify::new())))
        .hooks(hooks)
        .build();
    let (left, right) = tokio::io::duplex(64 * 1024);
    node.attach("raw", left, PeerInfo::default()).unwrap();
    (Arc::new(node), right)
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
