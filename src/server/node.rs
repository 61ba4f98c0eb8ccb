// src/server/node.rs

//! Defines `PeerNode`, the embeddable entry point that owns a node's shared
//! state and drives its connections.

use super::stream::{AnyStream, connect_tls};
use crate::client::RemoteCaller;
use crate::config::Config;
use crate::connection::{Connection, ConnectionHandler, ConnectionRegistry, PeerInfo};
use crate::core::auth::{Authenticator, StaticAuthenticator};
use crate::core::dispatch::{PartitionedPool, TaskPool};
use crate::core::errors::PeerLinkError;
use crate::core::hooks::{CloseReason, NoopHooks, RpcHooks};
use crate::core::methods::{MethodRegistry, MethodsHandler};
use crate::core::state::NodeState;
use crate::core::tasks::pinger::PingerTask;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long `shutdown` waits for connections and background tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Assembles a `PeerNode` from a configuration and optional collaborators.
pub struct PeerNodeBuilder {
    config: Config,
    authenticator: Option<Arc<dyn Authenticator>>,
    methods: Option<Arc<dyn MethodsHandler>>,
    hooks: Option<Arc<dyn RpcHooks>>,
    pool: Option<Arc<dyn TaskPool>>,
}

impl PeerNodeBuilder {
    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    pub fn methods(mut self, methods: impl MethodsHandler + 'static) -> Self {
        self.methods = Some(Arc::new(methods));
        self
    }

    pub fn hooks(mut self, hooks: impl RpcHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    pub fn pool(mut self, pool: impl TaskPool + 'static) -> Self {
        self.pool = Some(Arc::new(pool));
        self
    }

    /// Builds the node. Spawns the default worker pool, so this must run
    /// inside a tokio runtime.
    pub fn build(self) -> PeerNode {
        let config = self.config;
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(StaticAuthenticator::from_config(&config.auth)));
        let methods = self
            .methods
            .unwrap_or_else(|| Arc::new(MethodRegistry::new()));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(NoopHooks));
        let pool = self.pool.unwrap_or_else(|| {
            Arc::new(PartitionedPool::new(
                config.pool.workers,
                config.pool.queue_capacity,
            ))
        });

        PeerNode {
            state: Arc::new(NodeState::new(config, pool, authenticator, methods, hooks)),
            connections: Mutex::new(JoinSet::new()),
            background: Mutex::new(JoinSet::new()),
        }
    }
}

/// One participant in the peer network.
pub struct PeerNode {
    state: Arc<NodeState>,
    connections: Mutex<JoinSet<CloseReason>>,
    background: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for PeerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNode").field("state", &self.state).finish()
    }
}

impl PeerNode {
    pub fn builder(config: Config) -> PeerNodeBuilder {
        PeerNodeBuilder {
            config,
            authenticator: None,
            methods: None,
            hooks: None,
            pool: None,
        }
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// A facade for calling methods on this node's peers.
    pub fn caller(&self) -> RemoteCaller {
        RemoteCaller::new(
            Arc::clone(&self.state.registry),
            self.state.config.rpc.clone(),
        )
    }

    /// Registers an established stream under `key` and starts its dispatcher.
    pub fn attach<S>(
        &self,
        key: impl Into<String>,
        stream: S,
        peer: PeerInfo,
    ) -> Result<Arc<Connection>, PeerLinkError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let key = key.into();
        // Subscribe before checking the flag so a concurrent shutdown is never missed.
        let shutdown_rx = self.state.shutdown_tx.subscribe();
        if self.state.is_finishing() {
            return Err(PeerLinkError::Terminated(key));
        }
        let limit = self.state.config.max_connections;
        if self.state.registry.len() >= limit {
            return Err(PeerLinkError::Internal(format!(
                "connection limit of {limit} reached"
            )));
        }

        let rpc = &self.state.config.rpc;
        let (reader, writer) = tokio::io::split(stream);
        let conn = Connection::new(
            key,
            peer,
            Box::new(writer),
            self.state.codec(),
            rpc.write_timeout(),
        );
        let conn = self.state.registry.add(conn)?;
        info!("Connection {} attached ({:?}).", conn.key(), conn.peer());

        let handler = ConnectionHandler::new(
            Box::new(reader),
            Arc::clone(&conn),
            Arc::clone(&self.state),
            shutdown_rx,
        );
        let mut connections = self.connections.lock();
        while let Some(finished) = connections.try_join_next() {
            if let Err(e) = finished
                && e.is_panic()
            {
                error!("A connection handler panicked: {e:?}");
            }
        }
        connections.spawn(handler.run());
        Ok(conn)
    }

    /// Dials `addr` and attaches the stream under `key`. With `tls_server_name`
    /// set, the stream is wrapped in TLS and the server verified against it.
    pub async fn connect(
        &self,
        key: impl Into<String>,
        addr: &str,
        tls_server_name: Option<&str>,
    ) -> Result<Arc<Connection>, PeerLinkError> {
        let key = key.into();
        if self.state.registry.exists(&key) {
            return Err(PeerLinkError::KeyExists(key));
        }
        let tcp_stream = TcpStream::connect(addr).await?;
        let peer_addr = tcp_stream.peer_addr().ok();
        let (stream, tls_identity) = match tls_server_name {
            Some(server_name) => {
                let tls_stream = connect_tls(server_name, tcp_stream).await?;
                (
                    AnyStream::TlsClient(Box::new(tls_stream)),
                    Some(server_name.to_string()),
                )
            }
            None => (AnyStream::Tcp(tcp_stream), None),
        };
        self.attach(
            key,
            stream,
            PeerInfo {
                addr: peer_addr,
                tls_identity,
            },
        )
    }

    /// Starts the pinger unless the ping interval is 0. Returns whether it started.
    pub fn start_pinger(&self) -> bool {
        let Some(period) = self.state.config.rpc.ping_interval() else {
            info!("Pinger disabled by configuration.");
            return false;
        };
        let pinger = PingerTask::new(Arc::clone(&self.state), period);
        let shutdown_rx = self.state.shutdown_tx.subscribe();
        self.background.lock().spawn(pinger.run(shutdown_rx));
        true
    }

    /// Notifies every peer, stops the pinger, and waits for every connection
    /// to be torn down.
    pub async fn shutdown(&self) {
        info!("Node '{}' shutting down.", self.state.config.node_name);
        self.state.begin_shutdown();

        let mut connections = std::mem::take(&mut *self.connections.lock());
        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Timed out waiting for connections to close; aborting the rest.");
            connections.shutdown().await;
        }

        let mut background = std::mem::take(&mut *self.background.lock());
        if tokio::time::timeout(SHUTDOWN_GRACE, async {
            while background.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Timed out waiting for background tasks to finish.");
            background.shutdown().await;
        }
        info!("Node '{}' stopped.", self.state.config.node_name);
    }
}
