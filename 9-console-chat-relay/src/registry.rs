use std::{
    collections::BTreeMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionId};

/// Identity → connection map shared by every session.
///
/// Entries are non-owning: the session that negotiated a connection keeps the
/// only strong reference, so an entry whose session has gone away simply stops
/// resolving. The lock guards map updates only and is never held across I/O.
pub struct Registry {
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
struct RegistryEntry {
    connection_id: ConnectionId,
    connection: Weak<Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Maps the connection's identity to it, replacing any previous holder of
    /// that name. The displaced connection is left open.
    pub fn insert(&self, connection: &Arc<Connection>) -> Option<ConnectionId> {
        let entry = RegistryEntry {
            connection_id: connection.id(),
            connection: Arc::downgrade(connection),
        };
        self.entries
            .lock()
            .insert(connection.identity().to_string(), entry)
            .map(|previous| previous.connection_id)
    }

    /// Removes `identity` only while it still belongs to `connection_id`.
    ///
    /// Returns whether an entry was removed. A session that was displaced by a
    /// later join under the same name gets `false` and leaves the newer entry
    /// alone.
    pub fn remove(&self, identity: &str, connection_id: ConnectionId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(identity) {
            Some(entry) if entry.connection_id == connection_id => {
                entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<Arc<Connection>> {
        self.entries
            .lock()
            .get(identity)
            .and_then(|entry| entry.connection.upgrade())
    }

    /// Point-in-time copy of every live entry, ordered by identity.
    pub fn snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        let entries: Vec<(String, RegistryEntry)> = self
            .entries
            .lock()
            .iter()
            .map(|(identity, entry)| (identity.clone(), entry.clone()))
            .collect();

        entries
            .into_iter()
            .filter_map(|(identity, entry)| {
                entry
                    .connection
                    .upgrade()
                    .map(|connection| (identity, connection))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
