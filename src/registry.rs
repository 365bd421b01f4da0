//! Registry of live client connections.
//!
//! Each accepted connection is registered for as long as its handler runs.
//! The registry backs the live-connection count and lets shutdown report
//! which peers were still attached when the listener closed.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Bookkeeping for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote address of the client
    pub peer: SocketAddr,
    /// When the listener accepted the connection
    pub accepted_at: Instant,
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert and remove. Ids are reused after removal.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Slab<ConnectionInfo>,
}

impl ConnectionRegistry {
    /// Insert a connection and return its id.
    pub fn insert(&mut self, info: ConnectionInfo) -> usize {
        self.connections.insert(info)
    }

    /// Remove a connection, returning its bookkeeping if it was present.
    pub fn remove(&mut self, id: usize) -> Option<ConnectionInfo> {
        self.connections.try_remove(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Iterate over all live connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ConnectionInfo)> {
        self.connections.iter()
    }
}

/// Registry shared between the accept loop and connection handlers.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedRegistry {
    inner: Arc<Mutex<ConnectionRegistry>>,
}

impl SharedRegistry {
    /// Register a connection; it stays registered until the guard drops.
    pub(crate) fn register(&self, peer: SocketAddr) -> RegistrationGuard {
        let id = self.lock().insert(ConnectionInfo {
            peer,
            accepted_at: Instant::now(),
        });
        RegistrationGuard {
            registry: self.clone(),
            id,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot of all live connections.
    pub(crate) fn connections(&self) -> Vec<ConnectionInfo> {
        self.lock().iter().map(|(_, info)| info.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionRegistry> {
        // The registry holds plain bookkeeping, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes its connection from the registry when dropped.
#[derive(Debug)]
pub(crate) struct RegistrationGuard {
    registry: SharedRegistry,
    id: usize,
}

impl RegistrationGuard {
    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(self.id);
    }
}
