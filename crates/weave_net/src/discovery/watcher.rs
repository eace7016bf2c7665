use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DiscoveryBackend, NodeGroup, snapshot};

/// Mirrors every record under a prefix into a [`NodeGroup`].
///
/// The watch is opened before the snapshot is read so no change between
/// the two is lost. When the watch stream ends the watcher waits
/// `retry_delay`, re-snapshots and watches again.
pub struct Watcher {
    backend: Arc<dyn DiscoveryBackend>,
    prefix: String,
    group: Arc<NodeGroup>,
    retry_delay: Duration,
}

impl Watcher {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, prefix: impl Into<String>, group: Arc<NodeGroup>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            group,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = self.run() => {}
                _ = shutdown.recv() => debug!(prefix = %self.prefix, "Watcher shutting down"),
            }
        })
    }

    async fn run(&self) {
        loop {
            if let Err(e) = self.sync_once().await {
                warn!(prefix = %self.prefix, "Discovery watch failed: {e}");
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// One watch session: snapshot, then apply events until the stream ends.
    async fn sync_once(&self) -> Result<(), crate::error::NetError> {
        let mut events = self.backend.watch(&self.prefix).await?;
        let records = snapshot(self.backend.as_ref(), &self.prefix).await?;
        info!(prefix = %self.prefix, nodes = records.len(), "Discovery snapshot loaded");
        self.group.resync(records);

        while let Some(event) = events.recv().await {
            self.group.apply(&self.prefix, &event);
        }
        debug!(prefix = %self.prefix, "Discovery watch stream ended");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
