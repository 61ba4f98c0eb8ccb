// src/core/protocol/mod.rs

//! The binary wire protocol: frame types and the `tokio_util` codec that
//! reads and writes them.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{Answer, ExecStatus, Frame, Query, QueryFlags};
