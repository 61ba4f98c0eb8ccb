// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling graceful shutdown.

use super::context::ServerContext;
use super::node::PeerNode;
use super::stream::AnyStream;
use crate::config::Config;
use crate::connection::PeerInfo;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// The main server loop that accepts connections and handles graceful shutdown.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut handshakes = JoinSet::new();

    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }
            _ = sighup.recv() => {
                reload_log_level(&ctx);
            }

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        info!("Accepted new connection from: {}", addr);
                        let node = Arc::clone(&ctx.node);
                        let acceptor = ctx.acceptor.clone();
                        handshakes.spawn(accept_peer(node, acceptor, socket, addr));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            },

            Some(res) = handshakes.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A handshake task panicked: {e:?}");
                }
            },
        }
    }

    handshakes.shutdown().await;
    ctx.node.shutdown().await;
    info!("All peer connections closed.");

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
    Ok(())
}

/// Completes the optional TLS handshake and attaches the stream under the
/// remote address.
async fn accept_peer(
    node: Arc<PeerNode>,
    acceptor: Option<TlsAcceptor>,
    socket: TcpStream,
    addr: SocketAddr,
) {
    let key = addr.to_string();
    let result = match acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => {
                info!("TLS handshake successful for {addr}");
                let stream = AnyStream::Tls(Box::new(tls_stream));
                let peer = PeerInfo {
                    addr: Some(addr),
                    tls_identity: stream.client_certificate_fingerprint(),
                };
                node.attach(key, stream, peer)
            }
            Err(e) => {
                warn!("TLS handshake error for {addr}: {e}");
                return;
            }
        },
        None => node.attach(key, AnyStream::Tcp(socket), PeerInfo::from_addr(addr)),
    };
    if let Err(e) = result {
        warn!("Refusing connection from {}: {}", addr, e);
    }
}

/// Re-reads `log_level` from the configuration file and applies it.
fn reload_log_level(ctx: &ServerContext) {
    let Some(path) = ctx.config_path.as_deref() else {
        info!("SIGHUP received but no configuration file was given; ignoring.");
        return;
    };
    let level = match Config::from_file(path) {
        Ok(config) => config.log_level,
        Err(e) => {
            warn!("SIGHUP: could not reload '{}': {:#}", path, e);
            return;
        }
    };
    match EnvFilter::try_new(&level) {
        Ok(filter) => {
            if let Err(e) = ctx.log_reload_handle.reload(filter) {
                warn!("SIGHUP: failed to apply log level '{}': {}", level, e);
            } else {
                info!("SIGHUP: log level set to '{}'.", level);
            }
        }
        Err(e) => warn!("SIGHUP: invalid log level '{}': {}", level, e),
    }
}
