// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, reload};

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;
mod node;
mod spawner;
mod stream;

pub use initialization::builtin_methods;
pub use node::{PeerNode, PeerNodeBuilder};
pub use stream::{AnyStream, connect_tls};

/// Runs a standalone node until SIGINT or SIGTERM.
pub async fn run(
    config: Config,
    config_path: Option<String>,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Bind the listener and build the node.
    let mut server_context =
        initialization::setup(config, builtin_methods(), config_path, log_reload_handle).await?;

    // 2. Spawn the metrics server, the pinger and the peer dialer.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Accept peers until shutdown.
    connection_loop::run(server_context).await
}
