// src/connection/mod.rs

//! Per-stream state: the `Connection`, its registry and open-reference guard,
//! the session slot, and the dispatcher loop that reads inbound frames.

mod core;
mod guard;
mod handler;
mod registry;
mod session;

pub use self::core::{BoxedWriter, Connection, CorrelationStats, PeerInfo, PendingRequest};
pub use guard::OpenConnection;
pub use handler::{BoxedReader, ConnectionHandler};
pub use registry::ConnectionRegistry;
pub use session::{DestroyOutcome, Identity, Session, SessionHolder};
