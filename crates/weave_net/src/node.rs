//! Node: a backend process attached to one or more gates.
//!
//! A [`Node`] owns its handler table and correlator and keeps a
//! [`Connector`] per gate. Outbound traffic picks a live gate round-robin.
//! Clients use the same runtime with `Role::CLIENT`, dialing a gate's
//! client listener.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::TokenSigner;
use crate::codec::Message;
use crate::config::NodeConfig;
use crate::conn::{ConnHandler, ConnStatus, Connection};
use crate::connector::{Connector, ConnectorParams, TokenSource};
use crate::correlator::{ResponseCallback, await_response};
use crate::discovery::{GroupEvent, NodeGroup};
use crate::error::NetError;
use crate::frame::{DataKind, Frame, FrameKind};
use crate::identity::{Identity, Role};
use crate::route::{ErrCode, RouteEnvelope, SynGenerator};
use crate::router::{Context, DispatchOutcome, MessageHandler, MessageRouter};

struct NodeInner {
    config: NodeConfig,
    identity: Identity,
    router: MessageRouter,
    syn: SynGenerator,
    gates: RwLock<Vec<Connector>>,
    cursor: AtomicUsize,
    token: TokenSource,
}

/// A process participating in the routing fabric.
pub struct Node {
    inner: Arc<NodeInner>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let identity = config.identity();
        let token: TokenSource = match &config.token {
            Some(fixed) => {
                let fixed = Bytes::from(fixed.clone());
                Arc::new(move || fixed.clone())
            }
            None => {
                let signer = TokenSigner::new(config.token_secret.clone());
                let ttl = config.token_ttl;
                Arc::new(move || Bytes::from(signer.sign(identity, ttl)))
            }
        };
        Self {
            inner: Arc::new(NodeInner {
                identity,
                router: MessageRouter::new(identity),
                syn: SynGenerator::random(),
                gates: RwLock::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                token,
                config,
            }),
            shutdown_tx: None,
        }
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Register a typed handler for `msg_id` sent by `role`.
    pub fn on<M, F, Fut>(&self, role: Role, msg_id: u32, f: F)
    where
        M: Message,
        F: Fn(Context, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.router.register(role, msg_id, f);
    }

    pub fn on_raw(&self, role: Role, msg_id: u32, handler: MessageHandler) {
        self.inner.router.register_raw(role, msg_id, handler);
    }

    /// Dial every configured gate. Unreachable gates are retried in the
    /// background when reconnect is enabled.
    pub async fn start(&mut self) -> Result<(), NetError> {
        if self.is_running() {
            return Ok(());
        }
        let (shutdown_tx, _) = broadcast::channel(8);
        self.shutdown_tx = Some(shutdown_tx);

        for addr in self.inner.config.gate_addrs.clone() {
            if let Err(e) = self.inner.add_gate(&addr).await {
                warn!(node = %self.inner.identity, addr, "Gate not reachable yet: {e}");
            }
        }
        info!(node = %self.inner.identity, gates = self.inner.gates.read().len(), "Node started");
        Ok(())
    }

    /// Attach to another gate. Returns once the first dial finished.
    pub async fn add_gate(&self, addr: &str) -> Result<(), NetError> {
        self.inner.add_gate(addr).await
    }

    pub fn remove_gate(&self, addr: &str) -> bool {
        self.inner.remove_gate(addr)
    }

    pub fn gate_addrs(&self) -> Vec<String> {
        self.inner
            .gates
            .read()
            .iter()
            .map(|c| c.addr().to_string())
            .collect()
    }

    /// Number of gates with a live connection.
    pub fn connected_gates(&self) -> usize {
        self.inner
            .gates
            .read()
            .iter()
            .filter(|c| c.status() == ConnStatus::Connected)
            .count()
    }

    /// Keep the gate set in step with the gates present in `group`.
    pub fn follow_gates(&self, group: Arc<NodeGroup>) {
        let Some(shutdown_tx) = &self.shutdown_tx else {
            warn!("follow_gates called before start");
            return;
        };
        let mut shutdown = shutdown_tx.subscribe();
        let mut events = group.subscribe();
        let node: Weak<NodeInner> = Arc::downgrade(&self.inner);
        let existing: Vec<String> = group
            .records()
            .into_iter()
            .filter(|r| r.role == Role::GATE)
            .map(|r| r.addr)
            .collect();

        tokio::spawn(async move {
            for addr in existing {
                let Some(node) = node.upgrade() else { return };
                let _ = node.add_gate(&addr).await;
            }
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.recv() => return,
                };
                let Some(node) = node.upgrade() else { return };
                match event {
                    Ok(GroupEvent::Added(r)) | Ok(GroupEvent::Updated(r)) if r.role == Role::GATE => {
                        if let Err(e) = node.add_gate(&r.addr).await {
                            debug!(addr = r.addr, "Discovered gate not reachable: {e}");
                        }
                    }
                    Ok(GroupEvent::Removed(r)) if r.role == Role::GATE => {
                        node.remove_gate(&r.addr);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Gate events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Send a fire-and-forget message.
    pub fn send_async<M: Message>(&self, to: Identity, msg_id: u32, msg: &M) -> Result<(), NetError> {
        let env = RouteEnvelope::new_async(self.inner.identity, to, msg_id, msg)?;
        self.inner.pick_gate()?.send_route(&env)
    }

    /// Send a request and wait for its response using the configured
    /// timeout. A non-zero error code comes back as [`NetError::Remote`].
    pub async fn request<Req: Message, Resp: Message>(
        &self,
        to: Identity,
        msg_id: u32,
        req: &Req,
    ) -> Result<Resp, NetError> {
        self.request_timeout(to, msg_id, req, self.inner.config.request_timeout)
            .await
    }

    pub async fn request_timeout<Req: Message, Resp: Message>(
        &self,
        to: Identity,
        msg_id: u32,
        req: &Req,
        timeout: Duration,
    ) -> Result<Resp, NetError> {
        let syn = self.inner.syn.next();
        let env = RouteEnvelope::new_request(self.inner.identity, to, msg_id, syn, req)?;
        let conn = self.inner.pick_gate()?;
        let correlator = self.inner.router.correlator();
        let rx = correlator.register(to, syn, timeout)?;
        if let Err(e) = conn.send_route(&env) {
            correlator.pop_pending(to, syn);
            return Err(e);
        }
        let resp = await_response(rx, timeout).await?;
        if !resp.header.err_code.is_ok() {
            return Err(NetError::Remote(resp.header.err_code.0));
        }
        resp.message()
    }

    /// Send a request; `callback` runs exactly once with the response, a
    /// timeout, or a cancellation. A zero `timeout` waits indefinitely.
    pub fn request_with_callback<Req: Message>(
        &self,
        to: Identity,
        msg_id: u32,
        req: &Req,
        timeout: Duration,
        callback: ResponseCallback,
    ) -> Result<(), NetError> {
        let syn = self.inner.syn.next();
        let env = RouteEnvelope::new_request(self.inner.identity, to, msg_id, syn, req)?;
        let conn = self.inner.pick_gate()?;
        let correlator = self.inner.router.correlator();
        correlator.push_pending(to, syn, timeout, callback)?;
        if let Err(e) = conn.send_route(&env) {
            correlator.pop_pending(to, syn);
            return Err(e);
        }
        Ok(())
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.router.correlator().len()
    }

    /// Close every gate connection and cancel outstanding requests.
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = shutdown_tx.send(());
        let gates: Vec<Connector> = std::mem::take(&mut *self.inner.gates.write());
        for connector in &gates {
            connector.close();
        }
        self.inner.router.correlator().cancel_all();
        info!(node = %self.inner.identity, "Node stopped");
    }
}

impl NodeInner {
    async fn add_gate(self: &Arc<Self>, addr: &str) -> Result<(), NetError> {
        if self.gates.read().iter().any(|c| c.addr() == addr) {
            return Ok(());
        }
        let params = ConnectorParams::new(addr, self.identity, Bytes::new())
            .with_transport(self.config.transport)
            .with_token_source(Arc::clone(&self.token))
            .with_config(self.config.conn.clone());
        let handler = Arc::new(NodeConnHandler {
            node: Arc::downgrade(self),
        });
        let connector = Connector::new(params, handler);
        let result = connector.connect().await.map(|_| ());
        {
            let mut gates = self.gates.write();
            if gates.iter().any(|c| c.addr() == addr) {
                // Lost a race with a concurrent add; keep the first.
                return result;
            }
            gates.push(connector);
        }
        info!(node = %self.identity, addr, "Gate added");
        result
    }

    fn remove_gate(&self, addr: &str) -> bool {
        let removed = {
            let mut gates = self.gates.write();
            let before = gates.len();
            let mut kept = Vec::with_capacity(before);
            let mut removed = Vec::new();
            for connector in gates.drain(..) {
                if connector.addr() == addr {
                    removed.push(connector);
                } else {
                    kept.push(connector);
                }
            }
            *gates = kept;
            removed
        };
        for connector in &removed {
            connector.close();
        }
        if !removed.is_empty() {
            info!(node = %self.identity, addr, "Gate removed");
        }
        !removed.is_empty()
    }

    /// Next live gate connection, round-robin.
    fn pick_gate(&self) -> Result<Arc<Connection>, NetError> {
        let gates = self.gates.read();
        let n = gates.len();
        if n == 0 {
            return Err(NetError::NotRunning);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .find_map(|i| gates[(start + i) % n].connection())
            .ok_or(NetError::Disconnected)
    }
}

struct NodeConnHandler {
    node: Weak<NodeInner>,
}

#[async_trait]
impl ConnHandler for NodeConnHandler {
    async fn on_packet(&self, conn: &Arc<Connection>, frame: Frame) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        if !matches!(frame.kind, FrameKind::Data(DataKind::Route | DataKind::RouteFail)) {
            warn!(conn_id = conn.conn_id(), kind = ?frame.kind, "Unexpected frame kind, dropped");
            return;
        }
        let env = match RouteEnvelope::decode(frame.body) {
            Ok(env) => env,
            Err(e) => {
                warn!(conn_id = conn.conn_id(), "Malformed route envelope, closing: {e}");
                conn.close();
                return;
            }
        };
        let error = env.route_error(ErrCode::METHOD_NOT_FOUND);
        if node.router.dispatch(conn, env) == DispatchOutcome::NoHandler {
            let _ = conn.send(Frame::route_fail(error.encode()));
        }
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        debug!(conn_id = conn.conn_id(), remote = %conn.remote_addr(), "Gate connection closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
