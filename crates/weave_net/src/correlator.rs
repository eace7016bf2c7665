//! Pending-request table matching responses and timeouts to requests.
//!
//! Each entry is keyed by `(peer identity, syn)`. Response delivery, timer
//! expiry and explicit cancellation all remove the entry under the same
//! lock before invoking the callback, so the callback runs exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::identity::Identity;
use crate::route::{MsgType, RouteEnvelope};

/// How a pending request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Response(RouteEnvelope),
    Timeout,
    /// Cancelled locally, e.g. on shutdown.
    Cancelled,
}

impl ResponseOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

pub type ResponseCallback = Box<dyn FnOnce(ResponseOutcome) + Send + 'static>;

type PendingKey = (Identity, u32);

struct Pending {
    callback: ResponseCallback,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<PendingKey, Pending>>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pending request. A non-zero `timeout` arms a timer that
    /// completes the entry with [`ResponseOutcome::Timeout`].
    pub fn push_pending(
        self: &Arc<Self>,
        peer: Identity,
        syn: u32,
        timeout: Duration,
        callback: ResponseCallback,
    ) -> Result<(), NetError> {
        let key = (peer, syn);
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return Err(NetError::Protocol(format!(
                "request {syn} to {peer} already pending"
            )));
        }

        let timer = (!timeout.is_zero()).then(|| {
            let this: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let Some(this) = this.upgrade() else { return };
                if let Some(entry) = this.take(&key) {
                    debug!(%peer, syn, "Request timed out after {timeout:?}");
                    (entry.callback)(ResponseOutcome::Timeout);
                }
            })
        });

        pending.insert(key, Pending { callback, timer });
        Ok(())
    }

    fn take(&self, key: &PendingKey) -> Option<Pending> {
        self.pending.lock().remove(key)
    }

    /// Remove a pending entry and stop its timer. The callback is returned
    /// uninvoked.
    pub fn pop_pending(&self, peer: Identity, syn: u32) -> Option<ResponseCallback> {
        let entry = self.take(&(peer, syn))?;
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        Some(entry.callback)
    }

    /// Complete the matching entry with a response envelope. Returns false
    /// when nothing was pending (late or duplicate response).
    pub fn deliver(&self, env: RouteEnvelope) -> bool {
        debug_assert_eq!(env.header.msg_type, MsgType::Response);
        let peer = env.header.from();
        let syn = env.header.syn;
        match self.pop_pending(peer, syn) {
            Some(callback) => {
                callback(ResponseOutcome::Response(env));
                true
            }
            None => {
                trace!(%peer, syn, "Dropping response with no pending request");
                false
            }
        }
    }

    /// Complete one entry with [`ResponseOutcome::Cancelled`].
    pub fn cancel(&self, peer: Identity, syn: u32) -> bool {
        match self.pop_pending(peer, syn) {
            Some(callback) => {
                callback(ResponseOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Cancel everything still pending.
    pub fn cancel_all(&self) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            (entry.callback)(ResponseOutcome::Cancelled);
        }
    }

    /// Register a request and get a future for its outcome.
    pub fn register(
        self: &Arc<Self>,
        peer: Identity,
        syn: u32,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<ResponseOutcome>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.push_pending(
            peer,
            syn,
            timeout,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        Ok(rx)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn a registered outcome into the response envelope or an error.
pub async fn await_response(
    rx: oneshot::Receiver<ResponseOutcome>,
    timeout: Duration,
) -> Result<RouteEnvelope, NetError> {
    match rx.await {
        Ok(ResponseOutcome::Response(env)) => Ok(env),
        Ok(ResponseOutcome::Timeout) => Err(NetError::Timeout(timeout)),
        Ok(ResponseOutcome::Cancelled) | Err(_) => Err(NetError::Disconnected),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::ErrCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer() -> Identity {
        Identity::new(4, crate::identity::Role(16))
    }

    fn response(syn: u32) -> RouteEnvelope {
        let req = RouteEnvelope::new_request(Identity::client(1), peer(), 100, syn, &()).unwrap();
        RouteEnvelope::response_to(&req.header, ErrCode::OK, &()).unwrap()
    }

    fn counting_callback(
        hits: &Arc<AtomicUsize>,
        timeouts: &Arc<AtomicUsize>,
    ) -> ResponseCallback {
        let hits = Arc::clone(hits);
        let timeouts = Arc::clone(timeouts);
        Box::new(move |outcome| {
            hits.fetch_add(1, Ordering::SeqCst);
            if outcome.is_timeout() {
                timeouts.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_response_delivered_once() {
        let correlator = Correlator::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        correlator
            .push_pending(peer(), 7, Duration::from_secs(5), counting_callback(&hits, &timeouts))
            .unwrap();

        assert!(correlator.deliver(response(7)));
        assert!(!correlator.deliver(response(7)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_dropped() {
        let correlator = Correlator::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        correlator
            .push_pending(peer(), 9, Duration::from_secs(2), counting_callback(&hits, &timeouts))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert!(correlator.is_empty());

        assert!(!correlator.deliver(response(9)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_never_fires() {
        let correlator = Correlator::new();
        let rx = correlator.register(peer(), 3, Duration::ZERO).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(correlator.len(), 1);
        assert!(correlator.cancel(peer(), 3));
        assert_eq!(rx.await.unwrap(), ResponseOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let correlator = Correlator::new();
        let _rx = correlator.register(peer(), 1, Duration::ZERO).unwrap();
        assert!(correlator.register(peer(), 1, Duration::ZERO).is_err());
        // Same syn towards another peer is independent.
        assert!(correlator.register(Identity::client(9), 1, Duration::ZERO).is_ok());
    }

    #[tokio::test]
    async fn test_pop_cancels_timer() {
        let correlator = Correlator::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        correlator
            .push_pending(peer(), 5, Duration::from_millis(30), counting_callback(&hits, &timeouts))
            .unwrap();
        let callback = correlator.pop_pending(peer(), 5).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        callback(ResponseOutcome::Cancelled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_race_between_timer_and_response() {
        let correlator = Correlator::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));

        for syn in 1..=200u32 {
            correlator
                .push_pending(
                    peer(),
                    syn,
                    Duration::from_millis(5),
                    counting_callback(&hits, &timeouts),
                )
                .unwrap();
        }
        let mut tasks = Vec::new();
        for syn in 1..=200u32 {
            let correlator = Arc::clone(&correlator);
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis((syn % 10) as u64)).await;
                correlator.deliver(response(syn));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 200);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let correlator = Correlator::new();
        let a = correlator.register(peer(), 1, Duration::from_secs(30)).unwrap();
        let b = correlator.register(peer(), 2, Duration::ZERO).unwrap();
        correlator.cancel_all();
        assert!(matches!(
            await_response(a, Duration::from_secs(30)).await,
            Err(NetError::Disconnected)
        ));
        assert_eq!(b.await.unwrap(), ResponseOutcome::Cancelled);
        assert!(correlator.is_empty());
    }
}
