use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{DiscoveryBackend, LeaseId, WatchEvent};
use crate::error::NetError;

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

#[derive(Default)]
struct State {
    kv: BTreeMap<String, Vec<u8>>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    watchers: Vec<(String, mpsc::UnboundedSender<WatchEvent>)>,
}

impl State {
    fn notify(&mut self, event: WatchEvent) {
        let key = match &event {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key.clone(),
        };
        self.watchers.retain(|(prefix, tx)| {
            if !key.starts_with(prefix.as_str()) {
                return !tx.is_closed();
            }
            tx.send(event.clone()).is_ok()
        });
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };
        for key in entry.keys {
            if self.kv.remove(&key).is_some() {
                self.notify(WatchEvent::Delete { key });
            }
        }
        true
    }
}

/// In-process backend with the same lease semantics as etcd. Clones share
/// state, so a registrar and a watcher can meet on one instance.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    fn spawn_reaper(&self, lease: LeaseId) {
        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(state) = state.upgrade() else { return };
                    let guard = state.lock();
                    match guard.leases.get(&lease) {
                        Some(entry) => entry.expires_at,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let Some(state) = state.upgrade() else { return };
                let mut guard = state.lock();
                let expired = guard
                    .leases
                    .get(&lease)
                    .is_some_and(|entry| entry.expires_at <= Instant::now());
                if expired {
                    debug!(lease, "Lease expired");
                    guard.drop_lease(lease);
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    async fn register(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<LeaseId, NetError> {
        let lease = {
            let mut state = self.state.lock();
            state.next_lease += 1;
            let lease = state.next_lease;
            state.leases.insert(
                lease,
                Lease {
                    ttl,
                    expires_at: Instant::now() + ttl,
                    keys: HashSet::from([key.to_string()]),
                },
            );
            state.kv.insert(key.to_string(), value.clone());
            state.notify(WatchEvent::Put {
                key: key.to_string(),
                value,
            });
            lease
        };
        self.spawn_reaper(lease);
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), NetError> {
        let mut state = self.state.lock();
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.expires_at = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(NetError::Discovery(format!("lease {lease} not found"))),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), NetError> {
        self.state.lock().drop_lease(lease);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), NetError> {
        let mut state = self.state.lock();
        if state.kv.remove(key).is_some() {
            for entry in state.leases.values_mut() {
                entry.keys.remove(key);
            }
            state.notify(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, NetError> {
        let state = self.state.lock();
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>, NetError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keep_alive() {
        let backend = MemoryBackend::new();
        let mut events = backend.watch("/n/").await.unwrap();
        let lease = backend
            .register("/n/16/1", b"v".to_vec(), Duration::from_secs(3))
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(WatchEvent::Put { .. })));

        tokio::time::sleep(Duration::from_secs(2)).await;
        backend.keep_alive(lease).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.get("/n/").await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            events.recv().await,
            Some(WatchEvent::Delete {
                key: "/n/16/1".into()
            })
        );
        assert!(backend.get("/n/").await.unwrap().is_empty());
        assert!(backend.keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_get_respects_prefix() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.register("/a/1", b"1".to_vec(), ttl).await.unwrap();
        backend.register("/a/2", b"2".to_vec(), ttl).await.unwrap();
        backend.register("/b/1", b"3".to_vec(), ttl).await.unwrap();

        let keys: Vec<String> = backend
            .get("/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/a/1".to_string(), "/a/2".to_string()]);
    }

    #[tokio::test]
    async fn test_revoke_and_delete_notify_watchers() {
        let backend = MemoryBackend::new();
        let mut events = backend.watch("/a/").await.unwrap();
        let ttl = Duration::from_secs(60);
        let lease = backend.register("/a/1", b"1".to_vec(), ttl).await.unwrap();
        backend.register("/a/2", b"2".to_vec(), ttl).await.unwrap();
        backend.register("/b/1", b"3".to_vec(), ttl).await.unwrap();

        backend.revoke(lease).await.unwrap();
        backend.delete("/a/2").await.unwrap();
        backend.delete("/a/missing").await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2], WatchEvent::Delete { key: "/a/1".into() });
        assert_eq!(seen[3], WatchEvent::Delete { key: "/a/2".into() });
        assert_eq!(backend.lease_count(), 2);
    }
}
