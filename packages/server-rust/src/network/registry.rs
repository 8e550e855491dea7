//! Live-connection registry and the online-presence store.

use std::sync::Arc;

use courier_core::model::ClientId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::conn::StatefulConn;

/// Per-client online flag, maintained separately from the registry.
///
/// Delivery checks this on every attempt, so a connection can be marked
/// temporarily unreachable without being evicted from [`ConnManager`].
/// Missing entries read as offline.
#[derive(Debug, Default)]
pub struct Presence {
    flags: DashMap<ClientId, bool>,
}

impl Presence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, client_id: ClientId, online: bool) {
        self.flags.insert(client_id, online);
    }

    #[must_use]
    pub fn is_online(&self, client_id: ClientId) -> bool {
        self.flags.get(&client_id).is_some_and(|flag| *flag)
    }
}

/// Registry of authenticated connections, keyed by client id.
///
/// A client id maps to at most one live connection: re-registering evicts
/// the previous entry, marking it offline before the replacement becomes
/// visible.
#[derive(Debug)]
pub struct ConnManager {
    conns: DashMap<ClientId, Arc<StatefulConn>>,
    presence: Arc<Presence>,
}

impl ConnManager {
    #[must_use]
    pub fn new(presence: Arc<Presence>) -> Self {
        Self {
            conns: DashMap::new(),
            presence,
        }
    }

    /// Register a connection, returning the evicted predecessor if any.
    ///
    /// Eviction happens under the map shard lock: the old registration is
    /// marked offline before the new one is inserted, so no reader observes
    /// two live connections for one id.
    pub fn add(
        &self,
        client_id: ClientId,
        conn: Arc<StatefulConn>,
    ) -> Option<Arc<StatefulConn>> {
        match self.conns.entry(client_id) {
            Entry::Occupied(mut occupied) => {
                self.presence.set_online(client_id, false);
                Some(occupied.insert(conn))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(conn);
                None
            }
        }
    }

    /// Remove whatever connection is registered for `client_id`.
    pub fn remove(&self, client_id: ClientId) -> Option<Arc<StatefulConn>> {
        self.conns.remove(&client_id).map(|(_, conn)| conn)
    }

    /// Remove the registration only if it still is this exact connection.
    ///
    /// Used on connection exit so the death of an already-evicted
    /// connection cannot tear down its successor's registration.
    pub fn remove_matching(&self, client_id: ClientId, conn: &Arc<StatefulConn>) -> bool {
        self.conns
            .remove_if(&client_id, |_, current| Arc::ptr_eq(current, conn))
            .is_some()
    }

    #[must_use]
    pub fn get(&self, client_id: ClientId) -> Option<Arc<StatefulConn>> {
        self.conns.get(&client_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
