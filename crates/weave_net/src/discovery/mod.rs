//! Node discovery: lease-backed registration records under a key prefix,
//! a watcher that mirrors them into a [`NodeGroup`], and two backends.

mod etcd;
mod group;
mod memory;
mod registrar;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use etcd::EtcdBackend;
pub use group::{GroupEvent, NodeGroup};
pub use memory::MemoryBackend;
pub use registrar::{Registrar, RegistrationState};
pub use watcher::Watcher;

use crate::config::{DiscoveryBackendKind, DiscoveryConfig};
use crate::error::NetError;
use crate::identity::{Identity, Role};

pub type LeaseId = i64;

/// Change to a key under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Online,
    /// Still connected but should not receive new work.
    Draining,
}

/// What a node publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: u32,
    pub role: Role,
    /// Address other processes dial (node listener for gates).
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_addr: Option<String>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub version: String,
    pub registered_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(identity: Identity, addr: impl Into<String>) -> Self {
        Self {
            node_id: identity.user_id,
            role: identity.role,
            addr: addr.into(),
            ws_addr: None,
            status: NodeStatus::Online,
            version: env!("CARGO_PKG_VERSION").to_string(),
            registered_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.node_id, self.role)
    }

    /// Equal in everything a peer acts on; `registered_at` is ignored.
    pub fn same_content(&self, other: &NodeRecord) -> bool {
        self.node_id == other.node_id
            && self.role == other.role
            && self.addr == other.addr
            && self.ws_addr == other.ws_addr
            && self.status == other.status
            && self.version == other.version
    }
}

/// Key of a node's record: `{prefix}{role}/{node_id}`.
pub fn record_key(prefix: &str, identity: &Identity) -> String {
    format!("{prefix}{}/{}", identity.role.0, identity.user_id)
}

/// Inverse of [`record_key`].
pub fn identity_from_key(prefix: &str, key: &str) -> Option<Identity> {
    let rest = key.strip_prefix(prefix)?;
    let (role, id) = rest.split_once('/')?;
    Some(Identity::new(id.parse().ok()?, Role(role.parse().ok()?)))
}

/// Storage that discovery runs on.
///
/// Keys written by [`register`](Self::register) live as long as their lease;
/// a lease not kept alive for its TTL expires and its keys are deleted,
/// which watchers observe as [`WatchEvent::Delete`].
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Grant a lease of `ttl` and write `key = value` under it.
    async fn register(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<LeaseId, NetError>;

    /// Refresh a lease. Fails once the lease has expired.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), NetError>;

    /// Revoke a lease, deleting its keys.
    async fn revoke(&self, lease: LeaseId) -> Result<(), NetError>;

    async fn delete(&self, key: &str) -> Result<(), NetError>;

    /// All `(key, value)` pairs under `prefix`.
    async fn get(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, NetError>;

    /// Changes under `prefix` from now on. The stream ends when the
    /// backend loses the watch; callers re-snapshot and watch again.
    async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>, NetError>;
}

/// Build the backend selected by `config`.
pub fn build_backend(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryBackend>, NetError> {
    match config.backend {
        DiscoveryBackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        DiscoveryBackendKind::Etcd => Ok(Arc::new(EtcdBackend::new(
            config.endpoints.clone(),
            config.request_timeout,
        )?)),
    }
}

/// Records under `prefix`, skipping values that do not parse.
pub async fn snapshot(
    backend: &dyn DiscoveryBackend,
    prefix: &str,
) -> Result<Vec<NodeRecord>, NetError> {
    let pairs = backend.get(prefix).await?;
    Ok(pairs
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_slice(&value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key, "Skipping malformed node record: {e}");
                None
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
