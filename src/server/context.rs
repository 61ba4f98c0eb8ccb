// src/server/context.rs

use super::node::PeerNode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub node: Arc<PeerNode>,
    pub listener: TcpListener,
    pub acceptor: Option<TlsAcceptor>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    /// Re-read on SIGHUP to pick up a new `log_level`.
    pub config_path: Option<String>,
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}
