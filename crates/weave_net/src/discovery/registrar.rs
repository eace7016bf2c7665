use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DiscoveryBackend, LeaseId, NodeRecord, record_key};
use crate::error::NetError;

/// Lifecycle of a node's registration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    /// The key was deleted on shutdown.
    Deregistered,
    /// The lease lapsed; the renew loop re-registers on its next tick.
    Expired,
}

/// Publishes a [`NodeRecord`] under a lease and keeps it alive.
pub struct Registrar {
    backend: Arc<dyn DiscoveryBackend>,
    key: String,
    record: NodeRecord,
    ttl: Duration,
    state: Arc<watch::Sender<RegistrationState>>,
    lease: Option<LeaseId>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Option<LeaseId>>>,
}

impl Registrar {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        prefix: &str,
        record: NodeRecord,
        ttl: Duration,
    ) -> Self {
        let key = record_key(prefix, &record.identity());
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            backend,
            key,
            record,
            ttl,
            state: Arc::new(state),
            lease: None,
            stop_tx: None,
            task: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Write the record and start renewing its lease every `ttl / 3`.
    /// Fails if the first registration fails.
    pub async fn start(&mut self) -> Result<(), NetError> {
        if self.task.is_some() {
            return Ok(());
        }
        let value = serde_json::to_vec(&self.record)?;
        self.state.send_replace(RegistrationState::Registering);
        let lease = match self.backend.register(&self.key, value.clone(), self.ttl).await {
            Ok(lease) => lease,
            Err(e) => {
                self.state.send_replace(RegistrationState::Unregistered);
                return Err(e);
            }
        };
        self.state.send_replace(RegistrationState::Registered);
        info!(key = %self.key, lease, "Node registered");

        let (stop_tx, stop_rx) = oneshot::channel();
        self.lease = Some(lease);
        self.stop_tx = Some(stop_tx);
        self.task = Some(tokio::spawn(renew_loop(
            Arc::clone(&self.backend),
            self.key.clone(),
            value,
            self.ttl,
            lease,
            Arc::clone(&self.state),
            stop_rx,
        )));
        Ok(())
    }

    /// Stop renewing, delete the key and revoke the lease.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            // The loop hands back the lease it ended with.
            if let Ok(lease) = task.await {
                self.lease = lease;
            }
        }
        if let Err(e) = self.backend.delete(&self.key).await {
            warn!(key = %self.key, "Failed to delete registration: {e}");
        }
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.backend.revoke(lease).await {
                debug!(lease, "Lease revoke failed: {e}");
            }
        }
        self.state.send_replace(RegistrationState::Deregistered);
        info!(key = %self.key, "Node deregistered");
    }
}

async fn renew_loop(
    backend: Arc<dyn DiscoveryBackend>,
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    lease: LeaseId,
    state: Arc<watch::Sender<RegistrationState>>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Option<LeaseId> {
    let period = (ttl / 3).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut lease = Some(lease);

    loop {
        tokio::select! {
            _ = &mut stop_rx => return lease,
            _ = ticker.tick() => {}
        }

        match lease {
            Some(id) => {
                if let Err(e) = backend.keep_alive(id).await {
                    warn!(key, lease = id, "Lease keep-alive failed: {e}");
                    lease = None;
                    state.send_replace(RegistrationState::Expired);
                }
            }
            None => {
                state.send_replace(RegistrationState::Registering);
                match backend.register(&key, value.clone(), ttl).await {
                    Ok(id) => {
                        info!(key, lease = id, "Node re-registered");
                        lease = Some(id);
                        state.send_replace(RegistrationState::Registered);
                    }
                    Err(e) => {
                        warn!(key, "Re-registration failed: {e}");
                        state.send_replace(RegistrationState::Expired);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
