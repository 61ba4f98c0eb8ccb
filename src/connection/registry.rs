// src/connection/registry.rs

//! Defines `ConnectionRegistry`, the key → `Connection` map shared by the
//! dispatcher, the remote-call facade and the pinger.

use super::core::Connection;
use super::guard::OpenConnection;
use crate::core::errors::PeerLinkError;
use crate::core::metrics;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// A registered connection together with its open-reference count.
#[derive(Debug)]
pub(crate) struct RegistryEntry {
    pub(crate) conn: Arc<Connection>,
    pub(crate) refs: AtomicUsize,
    pub(crate) released: Notify,
}

impl RegistryEntry {
    fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            refs: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    /// Resolves once no open reference remains.
    async fn wait_unreferenced(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.refs.load(Ordering::Acquire) == 0 {
                return;
            }
            released.await;
        }
    }
}

/// Holds at most one live connection per key.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<String, Arc<RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn` under its key. Fails if the key is already taken.
    pub fn add(&self, conn: Connection) -> Result<Arc<Connection>, PeerLinkError> {
        match self.entries.entry(conn.key().to_string()) {
            Entry::Occupied(occupied) => Err(PeerLinkError::KeyExists(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let conn = Arc::new(conn);
                vacant.insert(Arc::new(RegistryEntry::new(Arc::clone(&conn))));
                metrics::CONNECTIONS.inc();
                debug!("Registered connection '{}'", conn.key());
                Ok(conn)
            }
        }
    }

    /// Opens a counted reference to the connection under `key`.
    pub fn open(&self, key: &str) -> Option<OpenConnection> {
        // The count is raised while the shard lock is held, so `destroy` either
        // never finds the entry or observes the new reference.
        let entry = self.entries.get(key)?;
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Some(OpenConnection::new(Arc::clone(entry.value())))
    }

    /// Gives an open reference back. Equivalent to dropping it.
    pub fn release(&self, conn: OpenConnection) {
        drop(conn);
    }

    /// Removes the entry under `key`, then waits for every open reference to
    /// be released before shutting the stream down.
    ///
    /// Returns `false` if no such key was registered.
    pub async fn destroy(&self, key: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        entry.wait_unreferenced().await;
        entry.conn.close_stream().await;
        metrics::CONNECTIONS.dec();
        debug!("Destroyed connection '{}'", key);
        true
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
