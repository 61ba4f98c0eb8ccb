// src/lib.rs

pub mod client;
pub mod config;
pub mod connection;
pub mod core;
pub mod server;

// Re-export
pub use crate::client::{CallOptions, RemoteCaller};
pub use crate::config::Config;
pub use crate::core::errors::{CallError, PeerLinkError};
pub use crate::server::{PeerNode, PeerNodeBuilder};
