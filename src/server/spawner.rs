// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use super::node::PeerNode;
use crate::config::PeerConfig;
use crate::core::errors::PeerLinkError;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How often configured peers that are not connected are dialed again.
const REDIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Spawns all background tasks into the context's JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let node = Arc::clone(&ctx.node);
    let state = node.state();
    let background_tasks = &mut ctx.background_tasks;

    // --- Metrics Server ---
    if state.config.metrics.enabled {
        let metrics_state = Arc::clone(state);
        let shutdown_rx_metrics = state.shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx_metrics).await
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Keepalive ---
    node.start_pinger();

    // --- Outbound Peers ---
    if !state.config.peers.is_empty() {
        let dialer_node = Arc::clone(&node);
        let shutdown_rx_dialer = state.shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            run_dialer(dialer_node, shutdown_rx_dialer).await;
            Ok(())
        });
    }

    info!("All background tasks have been spawned.");
    Ok(())
}

/// Keeps a connection open to every configured peer until shutdown.
async fn run_dialer(node: Arc<PeerNode>, mut shutdown_rx: broadcast::Receiver<()>) {
    let peers = node.config().peers.clone();
    info!("Dialer started for {} configured peer(s).", peers.len());
    let mut interval = tokio::time::interval(REDIAL_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for peer in &peers {
                    if node.registry().exists(&peer.key) {
                        continue;
                    }
                    dial(&node, peer).await;
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Dialer shutting down.");
                return;
            }
        }
    }
}

async fn dial(node: &PeerNode, peer: &PeerConfig) {
    let server_name = peer.tls.then(|| peer.server_name());
    match node.connect(peer.key.as_str(), &peer.addr, server_name).await {
        Ok(conn) => info!("Connected to peer '{}' at {}.", conn.key(), peer.addr),
        Err(PeerLinkError::KeyExists(_)) => {
            debug!("Peer '{}' connected while dialing.", peer.key);
        }
        Err(e) => warn!("Failed to connect to peer '{}' at {}: {}", peer.key, peer.addr, e),
    }
}
