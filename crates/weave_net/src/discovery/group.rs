//! In-memory pool of live nodes per role with round-robin selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{NodeRecord, WatchEvent, identity_from_key};
use crate::identity::{Identity, Role};

/// Membership change published by a [`NodeGroup`].
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    Added(NodeRecord),
    Updated(NodeRecord),
    Removed(NodeRecord),
}

#[derive(Default)]
struct Selector {
    node_ids: Vec<u32>,
    cursor: Arc<AtomicUsize>,
}

#[derive(Default)]
struct GroupInner {
    records: HashMap<Identity, NodeRecord>,
    selectors: HashMap<Role, Selector>,
}

/// Records keyed by node identity plus a per-role selector list.
///
/// A node id is in its role's selector list iff a record for it exists.
/// Selection only takes the read lock; the cursor is atomic.
pub struct NodeGroup {
    inner: RwLock<GroupInner>,
    events: broadcast::Sender<GroupEvent>,
}

impl Default for NodeGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeGroup {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(GroupInner::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    /// Insert or replace a record. Returns true if the node was new.
    pub fn upsert(&self, record: NodeRecord) -> bool {
        let identity = record.identity();
        let added = {
            let mut inner = self.inner.write();
            let added = inner.records.insert(identity, record.clone()).is_none();
            if added {
                inner
                    .selectors
                    .entry(identity.role)
                    .or_default()
                    .node_ids
                    .push(identity.user_id);
            }
            added
        };
        debug!(%identity, added, "Node record upserted");
        let _ = self.events.send(if added {
            GroupEvent::Added(record)
        } else {
            GroupEvent::Updated(record)
        });
        added
    }

    pub fn remove(&self, identity: &Identity) -> Option<NodeRecord> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.records.remove(identity)?;
            if let Some(selector) = inner.selectors.get_mut(&identity.role) {
                selector.node_ids.retain(|id| *id != identity.user_id);
                if selector.node_ids.is_empty() {
                    inner.selectors.remove(&identity.role);
                }
            }
            removed
        };
        debug!(%identity, "Node record removed");
        let _ = self.events.send(GroupEvent::Removed(removed.clone()));
        Some(removed)
    }

    /// Round-robin pick of a node id for `role`, or `None` if none is live.
    pub fn choose(&self, role: Role) -> Option<u32> {
        let inner = self.inner.read();
        let selector = inner.selectors.get(&role)?;
        if selector.node_ids.is_empty() {
            return None;
        }
        let idx = selector.cursor.fetch_add(1, Ordering::Relaxed) % selector.node_ids.len();
        Some(selector.node_ids[idx])
    }

    pub fn get(&self, identity: &Identity) -> Option<NodeRecord> {
        self.inner.read().records.get(identity).cloned()
    }

    /// Node ids of `role` in selection order.
    pub fn node_ids(&self, role: Role) -> Vec<u32> {
        self.inner
            .read()
            .selectors
            .get(&role)
            .map(|s| s.node_ids.clone())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<NodeRecord> {
        self.inner.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a watch event for a key under `prefix`.
    pub fn apply(&self, prefix: &str, event: &WatchEvent) {
        match event {
            WatchEvent::Put { key, value } => match serde_json::from_slice::<NodeRecord>(value) {
                Ok(record) => {
                    self.upsert(record);
                }
                Err(e) => warn!(key, "Ignoring malformed node record: {e}"),
            },
            WatchEvent::Delete { key } => match identity_from_key(prefix, key) {
                Some(identity) => {
                    self.remove(&identity);
                }
                None => warn!(key, "Ignoring delete for unrecognised key"),
            },
        }
    }

    /// Replace the whole membership with a snapshot, emitting the
    /// differences as events. Records whose content is unchanged emit
    /// nothing.
    pub fn resync(&self, snapshot: Vec<NodeRecord>) {
        let keep: std::collections::HashSet<Identity> =
            snapshot.iter().map(NodeRecord::identity).collect();
        let stale: Vec<Identity> = self
            .inner
            .read()
            .records
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for identity in stale {
            self.remove(&identity);
        }
        for record in snapshot {
            let unchanged = self
                .get(&record.identity())
                .is_some_and(|current| current.same_content(&record));
            if !unchanged {
                self.upsert(record);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
