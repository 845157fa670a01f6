use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::core::{Error, NodeId, NodeIdentity, NodeRecord, RecordState, Result};

/// Capacity of the registry event channel; laggards drop events, they never
/// block the discovery loops.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Liveness notification emitted by the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A previously unknown peer announced itself
    NodeFound(NodeIdentity),
    /// A known peer went silent past the TTL and was evicted
    NodeLost(NodeId),
}

/// Single source of truth for peers currently believed live
///
/// Cheap to clone; all clones share one peer map. Reads hand out snapshot
/// copies, so callers never observe a record mutating mid-iteration.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<Mutex<HashMap<NodeId, NodeRecord>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl NodeRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        NodeRegistry {
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribes to peer found/lost notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Inserts or refreshes a peer; returns whether it was previously unknown
    pub fn upsert(&self, identity: NodeIdentity) -> bool {
        let now = Instant::now();
        let is_new = {
            let mut peers = self.lock();
            match peers.get_mut(&identity.id) {
                Some(record) => {
                    record.identity = identity.clone();
                    record.last_seen = now;
                    record.state = RecordState::Discovered;
                    false
                }
                None => {
                    peers.insert(identity.id.clone(), NodeRecord::new(identity.clone(), now));
                    true
                }
            }
        };

        if is_new {
            let _ = self.events.send(RegistryEvent::NodeFound(identity));
        }
        is_new
    }

    /// Looks up a peer by ID
    pub fn lookup(&self, id: &NodeId) -> Result<NodeRecord> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Returns a snapshot of all known peer records
    pub fn list_all(&self) -> Vec<NodeRecord> {
        self.lock().values().cloned().collect()
    }

    /// Returns a snapshot of all known peer identities
    pub fn identities(&self) -> Vec<NodeIdentity> {
        self.lock().values().map(|r| r.identity.clone()).collect()
    }

    /// Flips records unrefreshed past half the TTL to `Stale`
    pub fn mark_stale(&self, now: Instant, ttl: Duration) {
        let mut peers = self.lock();
        for record in peers.values_mut() {
            if record.state == RecordState::Discovered && record.is_stale(now, ttl) {
                record.state = RecordState::Stale;
            }
        }
    }

    /// Removes records unrefreshed past the full TTL
    ///
    /// Emits `NodeLost` exactly once per removed peer.
    pub fn evict_expired(&self, now: Instant, ttl: Duration) -> Vec<NodeId> {
        let removed: Vec<NodeId> = {
            let mut peers = self.lock();
            let expired: Vec<NodeId> = peers
                .values()
                .filter(|r| r.is_expired(now, ttl))
                .map(|r| r.identity.id.clone())
                .collect();
            for id in &expired {
                peers.remove(id);
            }
            expired
        };

        for id in &removed {
            let _ = self.events.send(RegistryEvent::NodeLost(id.clone()));
        }
        removed
    }

    /// Returns the number of known peers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether no peers are known
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, NodeRecord>> {
        // The map stays structurally valid across a holder's panic.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
