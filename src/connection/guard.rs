// src/connection/guard.rs

//! Defines `OpenConnection`, an RAII guard over a counted registry reference.

use super::core::Connection;
use super::registry::RegistryEntry;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::trace;

/// A borrowed, counted reference to a registered connection.
///
/// The registry never finalises a connection while any guard is alive; the
/// count is released when the guard is dropped.
#[derive(Debug)]
pub struct OpenConnection {
    entry: Arc<RegistryEntry>,
}

impl OpenConnection {
    /// Wraps an entry whose reference count the caller has already raised.
    pub(crate) fn new(entry: Arc<RegistryEntry>) -> Self {
        Self { entry }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.entry.conn
    }
}

impl Deref for OpenConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.entry.conn
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!("Last open reference to '{}' released", self.entry.conn.key());
            self.entry.released.notify_waiters();
        }
    }
}
