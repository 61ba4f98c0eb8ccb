// src/core/errors.rs

//! Defines the error types for the transport and for the remote-call facade.

use crate::core::protocol::ExecStatus;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Library-level failures: framing, I/O and registry errors.
///
/// Framing variants are fatal to the connection that produced them.
#[derive(Error, Debug)]
pub enum PeerLinkError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("Read timed out waiting for a frame")]
    ReadTimeout,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Request id 0 is reserved")]
    ZeroRequestId,

    #[error("Message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("A connection with key '{0}' already exists")]
    KeyExists(String),

    #[error("Connection '{0}' is terminated")]
    Terminated(String),

    #[error("TLS Error: {0}")]
    Tls(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// `std::io::Error` is not cloneable, so it is kept behind an Arc.
impl Clone for PeerLinkError {
    fn clone(&self) -> Self {
        match self {
            PeerLinkError::Io(e) => PeerLinkError::Io(Arc::clone(e)),
            PeerLinkError::IncompleteData => PeerLinkError::IncompleteData,
            PeerLinkError::InvalidProtocol(s) => PeerLinkError::InvalidProtocol(s.clone()),
            PeerLinkError::ReadTimeout => PeerLinkError::ReadTimeout,
            PeerLinkError::WriteTimeout => PeerLinkError::WriteTimeout,
            PeerLinkError::ZeroRequestId => PeerLinkError::ZeroRequestId,
            PeerLinkError::MessageTooLarge { size, max } => PeerLinkError::MessageTooLarge {
                size: *size,
                max: *max,
            },
            PeerLinkError::KeyExists(s) => PeerLinkError::KeyExists(s.clone()),
            PeerLinkError::Terminated(s) => PeerLinkError::Terminated(s.clone()),
            PeerLinkError::Tls(s) => PeerLinkError::Tls(s.clone()),
            PeerLinkError::Internal(s) => PeerLinkError::Internal(s.clone()),
        }
    }
}

impl PartialEq for PeerLinkError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PeerLinkError::Io(e1), PeerLinkError::Io(e2)) => e1.kind() == e2.kind(),
            (PeerLinkError::InvalidProtocol(s1), PeerLinkError::InvalidProtocol(s2)) => s1 == s2,
            (
                PeerLinkError::MessageTooLarge { size: s1, max: m1 },
                PeerLinkError::MessageTooLarge { size: s2, max: m2 },
            ) => s1 == s2 && m1 == m2,
            (PeerLinkError::KeyExists(s1), PeerLinkError::KeyExists(s2)) => s1 == s2,
            (PeerLinkError::Terminated(s1), PeerLinkError::Terminated(s2)) => s1 == s2,
            (PeerLinkError::Tls(s1), PeerLinkError::Tls(s2)) => s1 == s2,
            (PeerLinkError::Internal(s1), PeerLinkError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for PeerLinkError {
    fn from(e: std::io::Error) -> Self {
        PeerLinkError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for PeerLinkError {
    fn from(e: serde_json::Error) -> Self {
        PeerLinkError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<rustls::Error> for PeerLinkError {
    fn from(e: rustls::Error) -> Self {
        PeerLinkError::Tls(e.to_string())
    }
}

/// The outcome of a failed remote call.
///
/// Every variant is a distinct call-site or application category, so a caller
/// never has to guess why a call did not produce a result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    // --- Call-site errors (nothing or only part of the exchange happened) ---
    #[error("Method '{0}' uses a reserved prefix and may not be called directly")]
    ReservedMethod(String),

    #[error("Payload of {size} bytes exceeds the maximum message size of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Peer '{0}' is not connected")]
    NotConnected(String),

    #[error("No answer received within {0:?}")]
    Timeout(Duration),

    #[error("Connection lost while waiting for the answer")]
    ConnectionLost,

    #[error("Failed to send the query: {0}")]
    SendFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // --- Application errors reported by the remote peer ---
    #[error("Remote peer rejected the call: task queue is full")]
    RemoteQueueOverflow,

    #[error("Remote method not found")]
    MethodNotFound,

    #[error("Not authorized: {0}")]
    NotAuthorized(Value),

    #[error("The method requires an authenticated session")]
    SessionRequired,

    #[error("Remote method failed: {0}")]
    Application(Value),

    #[error("Remote internal error: {0}")]
    RemoteInternal(String),
}

impl CallError {
    /// Classifies a non-success answer by its execution status.
    pub fn from_answer(status: ExecStatus, payload: Value) -> Self {
        match status {
            ExecStatus::Success => {
                CallError::RemoteInternal("success status classified as an error".to_string())
            }
            ExecStatus::QueueOverflow => CallError::RemoteQueueOverflow,
            ExecStatus::MethodNotFound => CallError::MethodNotFound,
            ExecStatus::NotAuthorized => CallError::NotAuthorized(payload),
            ExecStatus::SessionRequired => CallError::SessionRequired,
            ExecStatus::ApplicationError => CallError::Application(payload),
            ExecStatus::InternalError => CallError::RemoteInternal(match payload {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        }
    }

    /// A short, stable label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            CallError::ReservedMethod(_) => "reserved_method",
            CallError::PayloadTooLarge { .. } => "payload_too_large",
            CallError::NotConnected(_) => "not_connected",
            CallError::Timeout(_) => "timeout",
            CallError::ConnectionLost => "connection_lost",
            CallError::SendFailed(_) => "send_failed",
            CallError::Serialization(_) => "serialization",
            CallError::RemoteQueueOverflow => "queue_overflow",
            CallError::MethodNotFound => "method_not_found",
            CallError::NotAuthorized(_) => "not_authorized",
            CallError::SessionRequired => "session_required",
            CallError::Application(_) => "application_error",
            CallError::RemoteInternal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::Serialization(e.to_string())
    }
}
