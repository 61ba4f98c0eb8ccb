// src/server/initialization.rs

//! Handles node initialization: TLS material, the node itself and the
//! listening socket.

use super::context::ServerContext;
use super::node::PeerNode;
use crate::config::Config;
use crate::core::methods::{MethodContext, MethodError, MethodRegistry};
use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all node components before starting the main loop.
pub async fn setup(
    config: Config,
    methods: MethodRegistry,
    config_path: Option<String>,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config, &methods);

    let acceptor = setup_tls(&config).await?;

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(
        "PeerLink node '{}' listening on {}:{}",
        config.node_name, config.host, config.port
    );

    let node = PeerNode::builder(config).methods(methods).build();
    info!("Node state initialized.");

    Ok(ServerContext {
        node: Arc::new(node),
        listener,
        acceptor,
        background_tasks: JoinSet::new(),
        config_path,
        log_reload_handle,
    })
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
async fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(&config.tls.cert_path)?;
        let key = load_key(&config.tls.key_path)?;
        let builder = rustls::ServerConfig::builder();
        let server_config = match &config.tls.client_ca_path {
            Some(ca_path) => {
                info!("Requesting client certificates signed by '{}'.", ca_path);
                let mut roots = rustls::RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots.add(cert)?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .allow_unauthenticated()
                    .build()?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config, methods: &MethodRegistry) {
    let rpc = &config.rpc;
    info!(
        "Task pool: {} worker queue(s) of depth {}, key priority factor {}.",
        config.pool.workers, config.pool.queue_capacity, rpc.key_priority_factor
    );
    info!(
        "Max message size {} bytes; remote execution timeout {} ms.",
        rpc.max_message_size, rpc.remote_exec_timeout_ms
    );
    info!("{} application method(s) registered.", methods.len());
    if config.auth.users.is_empty() && config.auth.token_secret.is_none() {
        warn!("No users and no token secret configured: every SESSION.LOGIN will fail.");
    }
    if rpc.read_timeout().is_none() {
        warn!("Read timeout disabled: dead peers are only detected by the OS.");
    }
}

/// The methods a standalone node serves.
pub fn builtin_methods() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods
        .register("echo", |_ctx: MethodContext, payload: Value| async move { Ok(payload) })
        .register("time", |_ctx: MethodContext, _payload: Value| async move {
            Ok(json!({ "now": chrono::Utc::now().to_rfc3339() }))
        })
        .register_with_session("whoami", |ctx: MethodContext, _payload: Value| async move {
            let session = ctx
                .session
                .ok_or_else(|| MethodError::Internal("session missing".to_string()))?;
            serde_json::to_value(session.identity())
                .map_err(|e| MethodError::Internal(e.to_string()))
        });
    methods
}
