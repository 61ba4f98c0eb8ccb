// src/core/dispatch/mod.rs

//! Task dispatch: turns inbound queries into pool jobs and answers the ones
//! the pool refuses.

pub mod local;
pub mod pool;
pub mod task;

use crate::connection::{Connection, PeerInfo, SessionHolder};
use crate::core::metrics;
use crate::core::protocol::{ExecStatus, Query};
use crate::core::state::NodeState;
use bytes::Bytes;
use pool::Job;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, warn};

pub use local::{LocalTask, SESSION_PREFIX};
pub use pool::{PartitionedPool, TaskPool};
pub use task::TaskOutcome;

/// Everything a task needs to execute one inbound query and answer it.
#[derive(Debug)]
pub struct TaskParameters {
    pub conn: Arc<Connection>,
    pub request_id: u64,
    pub method: String,
    pub payload: Bytes,
    pub auth_token: Option<Bytes>,
    /// Keeps the connection's teardown waiting until the answer is sent.
    _in_flight: OwnedRwLockReadGuard<()>,
}

impl TaskParameters {
    pub fn new(conn: Arc<Connection>, query: Query, in_flight: OwnedRwLockReadGuard<()>) -> Self {
        Self {
            conn,
            request_id: query.request_id,
            method: query.method,
            payload: query.payload,
            auth_token: query.auth_token,
            _in_flight: in_flight,
        }
    }

    pub fn key(&self) -> &str {
        self.conn.key()
    }

    pub fn peer(&self) -> &PeerInfo {
        self.conn.peer()
    }

    pub fn sessions(&self) -> &SessionHolder {
        self.conn.sessions()
    }

    /// Decodes the JSON payload. An empty payload is `null`.
    pub fn decode_payload(&self) -> Result<Value, serde_json::Error> {
        if self.payload.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_slice(&self.payload)
        }
    }
}

/// Submits a query to the node's pool.
///
/// If the pool refuses it the query is answered with a queue-overflow status
/// right here, on the dispatcher's task, and is never executed.
pub async fn submit(state: &Arc<NodeState>, params: TaskParameters) {
    let conn = Arc::clone(&params.conn);
    let request_id = params.request_id;
    let method = params.method.clone();
    let rpc = &state.config.rpc;

    let job: Job = Box::pin(task::run(Arc::clone(state), params));
    let accepted = state
        .pool
        .push_task(
            job,
            rpc.queue_push_timeout(),
            rpc.key_priority_factor,
            conn.key(),
        )
        .await;
    if accepted {
        return;
    }

    metrics::QUEUE_OVERFLOWS_TOTAL.inc();
    warn!(
        "Connection {}: task queue full, rejecting '{}' (request {})",
        conn.key(),
        method,
        request_id
    );
    state.hooks.on_queue_full(conn.key(), &method);
    if let Err(e) = conn
        .send_answer(request_id, ExecStatus::QueueOverflow, Bytes::new())
        .await
    {
        debug!(
            "Connection {}: failed to send queue-overflow answer: {}",
            conn.key(),
            e
        );
    }
}
