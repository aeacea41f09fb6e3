//! Peer registry — the live sessions of this node, keyed by peer id.
//!
//! Every membership change is reported through the event bridge as a
//! [`NetworkEvent::PeersChanged`] carrying a snapshot taken after the change
//! became visible. Notifications are serialized so consumers observe the
//! snapshots in mutation order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::events::{EventBridge, NetworkEvent};
use crate::identity::PeerId;
use crate::session::{Connection, ConnectionId};

/// Concurrent map of active connections. At most one per peer.
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<Connection>>>,
    events: EventBridge,
    /// Held across mutate-then-notify so snapshots leave in order.
    notify: Mutex<()>,
}

impl PeerRegistry {
    pub fn new(events: EventBridge) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            events,
            notify: Mutex::new(()),
        }
    }

    /// Register `conn`. Returns `false`, changing nothing, if its peer is
    /// already registered.
    pub fn put(&self, conn: Arc<Connection>) -> bool {
        self.put_leading(conn, None)
    }

    /// [`PeerRegistry::put`], emitting `lead` right before the resulting
    /// `PeersChanged`. Nothing is emitted when the peer is already present.
    pub fn put_leading(&self, conn: Arc<Connection>, lead: Option<NetworkEvent>) -> bool {
        let _order = self.notify.lock();
        {
            let mut peers = self.peers.write();
            if peers.contains_key(conn.peer_id()) {
                return false;
            }
            debug!("Registered {} ({})", conn.peer_id(), conn.direction());
            peers.insert(conn.peer_id().clone(), conn);
        }
        if let Some(lead) = lead {
            self.events.emit(lead);
        }
        self.notify_changed();
        true
    }

    /// Remove the entry for `peer` if it is still the connection `id`.
    ///
    /// A session only ever removes itself, so a connection that lost a
    /// duplicate tie-break cannot evict the winner.
    pub fn remove(&self, peer: &PeerId, id: ConnectionId) -> bool {
        let _order = self.notify.lock();
        {
            let mut peers = self.peers.write();
            if !peers.get(peer).is_some_and(|current| current.id() == id) {
                return false;
            }
            peers.remove(peer);
            debug!("Unregistered {peer}");
        }
        self.notify_changed();
        true
    }

    /// Swap the connection registered for `conn`'s peer, provided it is still
    /// `expected`. Returns the displaced connection.
    ///
    /// The peer set is unchanged, so no event is emitted.
    pub fn replace(&self, conn: Arc<Connection>, expected: ConnectionId) -> Option<Arc<Connection>> {
        let _order = self.notify.lock();
        let mut peers = self.peers.write();
        if !peers
            .get(conn.peer_id())
            .is_some_and(|current| current.id() == expected)
        {
            return None;
        }
        peers.insert(conn.peer_id().clone(), conn)
    }

    pub fn has(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.peers.read().get(peer).cloned()
    }

    /// Registered peer ids, sorted.
    pub fn snapshot(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handles to every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Drop every entry, returning the connections so they can be closed.
    pub fn clear(&self) -> Vec<Arc<Connection>> {
        let _order = self.notify.lock();
        let drained: Vec<Arc<Connection>> = self.peers.write().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            self.notify_changed();
        }
        drained
    }

    fn notify_changed(&self) {
        self.events.emit(NetworkEvent::PeersChanged {
            peers: self.snapshot(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
