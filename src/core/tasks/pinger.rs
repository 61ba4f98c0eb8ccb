// src/core/tasks/pinger.rs

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{CallOptions, RemoteCaller};
use crate::core::errors::CallError;
use crate::core::metrics;
use crate::core::state::NodeState;

/// A method no peer implements. A "method not found" answer proves the peer
/// is alive and reading.
pub const PING_METHOD: &str = "__peerlink.ping__";

/// Periodically probes every registered connection.
pub struct PingerTask {
    state: Arc<NodeState>,
    caller: RemoteCaller,
    period: Duration,
}

impl PingerTask {
    pub fn new(state: Arc<NodeState>, period: Duration) -> Self {
        let caller = RemoteCaller::new(Arc::clone(&state.registry), state.config.rpc.clone());
        Self {
            state,
            caller,
            period,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Pinger task started with a {:?} period.", self.period);
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::select! {
                        healthy = self.ping_all() => {
                            debug!("Ping round finished: {} healthy peer(s).", healthy);
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Pinger task shutting down.");
                            return;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Pinger task shutting down.");
                    return;
                }
            }
        }
    }

    /// Pings every registered connection concurrently and returns how many
    /// answered.
    pub async fn ping_all(&self) -> usize {
        let keys = self.state.registry.list_keys();
        let results = join_all(keys.iter().map(|key| self.ping_one(key))).await;
        results.into_iter().filter(|healthy| *healthy).count()
    }

    async fn ping_one(&self, key: &str) -> bool {
        if self.state.is_finishing() {
            return false;
        }
        metrics::PINGS_TOTAL.inc();
        let options = CallOptions::default()
            .with_timeout(self.period.min(self.state.config.rpc.remote_exec_timeout()));
        match self
            .caller
            .call(key, PING_METHOD, &Value::Null, &options)
            .await
        {
            Ok(_) | Err(CallError::MethodNotFound) => true,
            Err(CallError::NotConnected(_)) => false,
            Err(e) => {
                match self.state.registry.open(key).map(|conn| conn.idle_for()) {
                    Some(idle) => warn!(
                        "Ping to '{}' failed after {:?} without a frame: {}",
                        key, idle, e
                    ),
                    None => warn!("Ping to '{}' failed: {}", key, e),
                }
                false
            }
        }
    }
}
