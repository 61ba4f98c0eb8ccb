// src/core/tasks/mod.rs

//! Long-running background tasks of a node.

pub mod pinger;
