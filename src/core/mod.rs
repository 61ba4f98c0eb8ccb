// src/core/mod.rs

//! The RPC machinery shared by every connection: wire protocol, dispatch,
//! authentication and the node state.

pub mod auth;
pub mod dispatch;
pub mod errors;
pub mod hooks;
pub mod methods;
pub mod metrics;
pub mod protocol;
pub mod state;
pub mod tasks;

pub use errors::{CallError, PeerLinkError};
pub use protocol::Frame;
