// src/core/protocol/frame.rs

//! Frame definitions for the PeerLink wire protocol.
//!
//! Layout (all integers big-endian, no version negotiation):
//!
//! ```text
//! Query    'Q' | id: u64 | flags: u8 | name_len: u8  | name | payload_len: u32 | payload
//!                                                   [ | token_len: u32 | token ]   (EXTRA_AUTH)
//! Answer   'A' | id: u64 | status: u8 | payload_len: u32 | payload
//! Shutdown 0x00
//! ```

use crate::core::errors::PeerLinkError;
use bitflags::bitflags;
use bytes::Bytes;
use serde::Serialize;

/// Type tag of a query frame.
pub const FRAME_QUERY: u8 = b'Q';
/// Type tag of an answer frame.
pub const FRAME_ANSWER: u8 = b'A';
/// Type tag of a peer-initiated shutdown.
pub const FRAME_SHUTDOWN: u8 = 0;

/// The longest method name that fits the one-byte length prefix.
pub const MAX_METHOD_NAME_LEN: usize = u8::MAX as usize;

bitflags! {
    /// Flags carried by every query frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueryFlags: u8 {
        /// A token block follows the payload.
        const EXTRA_AUTH = 1 << 0;
    }
}

/// The execution status carried by an answer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExecStatus {
    Success = 0,
    /// The callee's task queue rejected the call; it was never executed.
    QueueOverflow = 1,
    MethodNotFound = 2,
    NotAuthorized = 3,
    SessionRequired = 4,
    /// The method ran and reported a failure of its own.
    ApplicationError = 5,
    InternalError = 6,
}

impl ExecStatus {
    pub fn is_success(self) -> bool {
        self == ExecStatus::Success
    }
}

impl TryFrom<u8> for ExecStatus {
    type Error = PeerLinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExecStatus::Success),
            1 => Ok(ExecStatus::QueueOverflow),
            2 => Ok(ExecStatus::MethodNotFound),
            3 => Ok(ExecStatus::NotAuthorized),
            4 => Ok(ExecStatus::SessionRequired),
            5 => Ok(ExecStatus::ApplicationError),
            6 => Ok(ExecStatus::InternalError),
            other => Err(PeerLinkError::InvalidProtocol(format!(
                "unknown execution status {other}"
            ))),
        }
    }
}

/// An inbound or outbound method call.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub request_id: u64,
    pub method: String,
    pub payload: Bytes,
    /// Optional per-call authentication token.
    pub auth_token: Option<Bytes>,
}

impl Query {
    pub fn flags(&self) -> QueryFlags {
        if self.auth_token.is_some() {
            QueryFlags::EXTRA_AUTH
        } else {
            QueryFlags::empty()
        }
    }
}

/// The answer to a previously issued query.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub request_id: u64,
    pub status: ExecStatus,
    pub payload: Bytes,
}

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Query(Query),
    Answer(Answer),
    Shutdown,
}

impl Frame {
    /// Human-readable frame kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Query(_) => "query",
            Frame::Answer(_) => "answer",
            Frame::Shutdown => "shutdown",
        }
    }
}
