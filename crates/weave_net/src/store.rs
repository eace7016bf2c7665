//! Connection registry enforcing one live connection per identity.
//!
//! Two duplicate policies exist. Clients reconnect, so the newest
//! connection wins and inherits the old one's user data. Node ids are
//! configuration, so a second connection claiming a live node id is
//! refused and closed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::error::NetError;
use crate::identity::{ConnId, Identity};

/// How a store treats a second connection for a stored identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// Replace the stored connection and close it.
    SwapNewest,
    /// Keep the stored connection and close the newcomer.
    RejectDuplicate,
}

/// Invoked after a connection is stored (`true`) or removed (`false`).
pub type EnableCallback = Arc<dyn Fn(&Arc<Connection>, bool) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    by_identity: HashMap<Identity, Arc<Connection>>,
    by_conn_id: HashMap<ConnId, Arc<Connection>>,
}

impl StoreInner {
    fn insert(&mut self, conn: &Arc<Connection>) -> Option<Arc<Connection>> {
        self.by_conn_id.insert(conn.conn_id(), Arc::clone(conn));
        let old = self.by_identity.insert(conn.identity(), Arc::clone(conn));
        match old {
            Some(old) if !Arc::ptr_eq(&old, conn) => {
                self.by_conn_id.remove(&old.conn_id());
                Some(old)
            }
            _ => None,
        }
    }
}

pub struct ConnStore {
    name: &'static str,
    policy: StorePolicy,
    inner: RwLock<StoreInner>,
    callback: Option<EnableCallback>,
}

impl ConnStore {
    pub fn new(name: &'static str, policy: StorePolicy) -> Self {
        Self {
            name,
            policy,
            inner: RwLock::new(StoreInner::default()),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: EnableCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    /// Connection lifecycle entry point.
    ///
    /// Enabling applies the store policy and returns whether the connection
    /// was stored. Disabling removes the entry only when the stored
    /// connection is this very instance, so a stale disconnect cannot evict
    /// a newer connection; the disable callback fires only in that case.
    pub fn on_conn_enable(&self, conn: &Arc<Connection>, enabled: bool) -> bool {
        if !enabled {
            let removed = self.remove_if_same(conn);
            if removed {
                debug!(store = self.name, identity = %conn.identity(), "Connection removed");
                self.notify(conn, false);
            }
            return removed;
        }

        match self.policy {
            StorePolicy::SwapNewest => match self.swap_by_identity(conn) {
                Ok(Some(old)) => {
                    info!(
                        store = self.name,
                        identity = %conn.identity(),
                        old_conn = old.conn_id(),
                        new_conn = conn.conn_id(),
                        "Connection superseded"
                    );
                    // `old` was closed under the lock and is no longer
                    // stored, so its own disable is a no-op.
                    self.notify(conn, true);
                    true
                }
                Ok(None) => {
                    self.notify(conn, true);
                    true
                }
                Err(_) => false,
            },
            StorePolicy::RejectDuplicate => match self.load_or_store_by_identity(conn) {
                Ok(()) => {
                    self.notify(conn, true);
                    true
                }
                Err(NetError::DuplicateIdentity(identity)) => {
                    warn!(
                        store = self.name,
                        %identity,
                        rejected_conn = conn.conn_id(),
                        "Duplicate identity, closing new connection"
                    );
                    conn.close();
                    false
                }
                Err(_) => false,
            },
        }
    }

    fn notify(&self, conn: &Arc<Connection>, enabled: bool) {
        if let Some(cb) = &self.callback {
            cb(conn, enabled);
        }
    }

    /// Store `conn`, returning the connection it replaced. The replaced
    /// connection's user data moves to `conn` and it is closed before the
    /// write lock is released, so no reader ever sees two live connections
    /// for one identity.
    pub fn swap_by_identity(
        &self,
        conn: &Arc<Connection>,
    ) -> Result<Option<Arc<Connection>>, NetError> {
        let mut inner = self.inner.write();
        if !conn.enable() {
            return Err(NetError::Disconnected);
        }
        let old = inner.insert(conn);
        if let Some(old) = &old {
            if let Some(data) = old.take_user_data() {
                conn.set_user_data(Some(data));
            }
            old.close();
        }
        Ok(old)
    }

    /// Store `conn` unless its identity is already taken.
    pub fn load_or_store_by_identity(&self, conn: &Arc<Connection>) -> Result<(), NetError> {
        let mut inner = self.inner.write();
        if !conn.enable() {
            return Err(NetError::Disconnected);
        }
        if inner.by_identity.contains_key(&conn.identity()) {
            return Err(NetError::DuplicateIdentity(conn.identity()));
        }
        inner.insert(conn);
        Ok(())
    }

    /// Remove `conn` if it is the stored instance for its identity.
    pub fn remove_if_same(&self, conn: &Arc<Connection>) -> bool {
        let mut inner = self.inner.write();
        match inner.by_identity.get(&conn.identity()) {
            Some(stored) if Arc::ptr_eq(stored, conn) => {
                inner.by_identity.remove(&conn.identity());
                inner.by_conn_id.remove(&conn.conn_id());
                true
            }
            _ => false,
        }
    }

    pub fn load_by_identity(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.inner.read().by_identity.get(identity).cloned()
    }

    pub fn load_by_conn_id(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.inner.read().by_conn_id.get(&conn_id).cloned()
    }

    /// Visit a snapshot of the stored connections until `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&Arc<Connection>) -> bool) {
        let snapshot: Vec<Arc<Connection>> = self.inner.read().by_identity.values().cloned().collect();
        for conn in &snapshot {
            if !f(conn) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every stored connection. Entries leave as their disables arrive.
    pub fn close_all(&self) {
        self.range(|conn| {
            conn.close();
            true
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::null_conn;
    use crate::identity::Role;
    use parking_lot::Mutex;

    fn recording_store(policy: StorePolicy) -> (ConnStore, Arc<Mutex<Vec<(ConnId, bool)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let store = ConnStore::new("test", policy).with_callback(Arc::new(move |conn, enabled| {
            sink.lock().push((conn.conn_id(), enabled));
        }));
        (store, events)
    }

    #[tokio::test]
    async fn test_swap_moves_user_data_and_closes_old() {
        let (store, events) = recording_store(StorePolicy::SwapNewest);
        let id = Identity::client(10);

        let a = null_conn(id);
        a.set_user_data(Some(Arc::new("session-x".to_string())));
        assert!(store.on_conn_enable(&a, true));

        let b = null_conn(id);
        assert!(store.on_conn_enable(&b, true));

        assert!(a.is_closed());
        assert!(b.enable());
        let data = b.user_data().unwrap();
        assert_eq!(data.downcast_ref::<String>().unwrap(), "session-x");
        assert_eq!(store.len(), 1);
        assert!(Arc::ptr_eq(&store.load_by_identity(&id).unwrap(), &b));

        // The superseded connection's disable is suppressed.
        assert!(!store.on_conn_enable(&a, false));
        assert_eq!(
            *events.lock(),
            vec![(a.conn_id(), true), (b.conn_id(), true)]
        );
        assert!(store.load_by_conn_id(a.conn_id()).is_none());
        assert!(store.load_by_conn_id(b.conn_id()).is_some());
    }

    #[tokio::test]
    async fn test_swap_closes_old_before_returning() {
        let store = ConnStore::new("test", StorePolicy::SwapNewest);
        let id = Identity::client(14);
        let a = null_conn(id);
        let b = null_conn(id);

        assert!(store.swap_by_identity(&a).unwrap().is_none());
        let old = store.swap_by_identity(&b).unwrap().unwrap();
        assert!(Arc::ptr_eq(&old, &a));
        assert!(a.is_closed());
        assert!(matches!(
            a.send(crate::frame::Frame::heartbeat()),
            Err(NetError::Disconnected)
        ));
        assert!(b.enable());
    }

    #[tokio::test]
    async fn test_reenabling_stored_connection_keeps_it() {
        let store = ConnStore::new("test", StorePolicy::SwapNewest);
        let a = null_conn(Identity::client(15));
        assert!(store.on_conn_enable(&a, true));
        assert!(store.on_conn_enable(&a, true));
        assert!(a.enable());
        assert_eq!(store.len(), 1);
        assert!(store.load_by_conn_id(a.conn_id()).is_some());
    }

    #[tokio::test]
    async fn test_reject_duplicate_keeps_existing() {
        let (store, events) = recording_store(StorePolicy::RejectDuplicate);
        let id = Identity::new(3, Role(20));

        let a = null_conn(id);
        let b = null_conn(id);
        assert!(store.on_conn_enable(&a, true));
        assert!(!store.on_conn_enable(&b, true));

        assert!(a.enable());
        assert!(b.is_closed());
        assert!(Arc::ptr_eq(&store.load_by_identity(&id).unwrap(), &a));

        // The rejected connection's disable leaves the store alone.
        assert!(!store.on_conn_enable(&b, false));
        assert_eq!(store.len(), 1);
        assert_eq!(*events.lock(), vec![(a.conn_id(), true)]);
    }

    #[tokio::test]
    async fn test_disable_removes_same_instance() {
        let (store, events) = recording_store(StorePolicy::SwapNewest);
        let a = null_conn(Identity::client(11));
        store.on_conn_enable(&a, true);
        a.close();
        assert!(store.on_conn_enable(&a, false));
        assert!(store.is_empty());
        assert_eq!(events.lock().last(), Some(&(a.conn_id(), false)));
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_stored() {
        let store = ConnStore::new("test", StorePolicy::SwapNewest);
        let a = null_conn(Identity::client(12));
        a.close();
        assert!(!store.on_conn_enable(&a, true));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_at_most_one_live_connection_per_identity() {
        let store = Arc::new(ConnStore::new("test", StorePolicy::SwapNewest));
        let id = Identity::client(13);

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let conn = null_conn(id);
                store.on_conn_enable(&conn, true);
                tokio::task::yield_now().await;
                store.on_conn_enable(&conn, false);
                let conn = null_conn(id);
                store.on_conn_enable(&conn, true);
                conn
            }));
        }
        let mut conns = Vec::new();
        for task in tasks {
            conns.push(task.await.unwrap());
        }

        assert_eq!(store.len(), 1);
        let stored = store.load_by_identity(&id).unwrap();
        let live: Vec<_> = conns.iter().filter(|c| c.enable()).collect();
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(live[0], &stored));
    }

    #[tokio::test]
    async fn test_range_and_close_all() {
        let store = ConnStore::new("test", StorePolicy::SwapNewest);
        let conns: Vec<_> = (0..4).map(|i| null_conn(Identity::client(100 + i))).collect();
        for conn in &conns {
            store.on_conn_enable(conn, true);
        }

        let mut seen = 0;
        store.range(|_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);

        store.close_all();
        assert!(conns.iter().all(|c| c.is_closed()));
    }
}
