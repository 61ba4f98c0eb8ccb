// src/core/state.rs

//! Defines `NodeState`, the state shared by every connection of one node.

use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::core::auth::Authenticator;
use crate::core::dispatch::pool::TaskPool;
use crate::core::hooks::RpcHooks;
use crate::core::methods::MethodsHandler;
use crate::core::protocol::FrameCodec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// The collaborators and settings of a running node.
pub struct NodeState {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub pool: Arc<dyn TaskPool>,
    pub authenticator: Arc<dyn Authenticator>,
    pub methods: Arc<dyn MethodsHandler>,
    pub hooks: Arc<dyn RpcHooks>,
    /// Fires once when the node starts shutting down.
    pub shutdown_tx: broadcast::Sender<()>,
    finishing: AtomicBool,
}

impl std::fmt::Debug for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeState")
            .field("node_name", &self.config.node_name)
            .field("connections", &self.registry.len())
            .field("finishing", &self.is_finishing())
            .finish()
    }
}

impl NodeState {
    pub fn new(
        config: Config,
        pool: Arc<dyn TaskPool>,
        authenticator: Arc<dyn Authenticator>,
        methods: Arc<dyn MethodsHandler>,
        hooks: Arc<dyn RpcHooks>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            pool,
            authenticator,
            methods,
            hooks,
            shutdown_tx,
            finishing: AtomicBool::new(false),
        }
    }

    /// A codec configured with this node's message size limit.
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.config.rpc.max_message_size)
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::SeqCst)
    }

    /// Marks the node as finishing and signals every background loop.
    pub fn begin_shutdown(&self) {
        if !self.finishing.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
        }
    }
}
