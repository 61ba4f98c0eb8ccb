// src/client/mod.rs

//! The remote-call facade: the awaiting client API used to invoke methods on a
//! connected peer.

mod caller;

pub use caller::{CallOptions, RemoteCaller};
