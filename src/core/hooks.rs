// src/core/hooks.rs

//! Observation points an embedding application may hook into.

use crate::core::auth::AuthReason;
use crate::core::protocol::ExecStatus;

/// Why a connection's dispatcher loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a shutdown frame.
    PeerShutdown,
    /// The stream reached end of file.
    PeerClosed,
    /// This node is shutting down.
    LocalShutdown,
    ReadTimeout,
    /// The stream carried bytes that are not a valid frame.
    InvalidProtocol(String),
}

impl CloseReason {
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerShutdown | CloseReason::PeerClosed | CloseReason::LocalShutdown
        )
    }
}

/// Callbacks invoked by the transport. Every method defaults to a no-op.
pub trait RpcHooks: Send + Sync {
    /// An answer arrived for a request id that is not pending.
    fn on_unexpected_answer(&self, _key: &str, _request_id: u64, _status: ExecStatus) {}

    fn on_method_not_found(&self, _key: &str, _method: &str) {}

    /// The task pool refused an inbound query.
    fn on_queue_full(&self, _key: &str, _method: &str) {}

    fn on_login_failed(&self, _key: &str, _reason: AuthReason) {}

    fn on_connection_closed(&self, _key: &str, _reason: &CloseReason) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl RpcHooks for NoopHooks {}
