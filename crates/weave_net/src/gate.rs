//! The gate: edge process relaying between clients and nodes.
//!
//! A [`Gate`] accepts clients over TCP and/or WebSocket and nodes over TCP,
//! authenticates each with the control handshake, and keeps one store per
//! side. Route envelopes are forwarded unchanged:
//! - `to_role == LOCAL` (or addressed to the gate itself) is dispatched to
//!   the gate's own handlers.
//! - from a client: delivered to the addressed node, or a round-robin node
//!   of the role when `to_user_id == 0`. Unknown targets are answered with
//!   a route error.
//! - from a node: delivered to the addressed client (dropped if it is
//!   gone) or to another node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::auth::Authenticator;
use crate::codec::{Json, Message};
use crate::config::GateConfig;
use crate::conn::{ConnHandler, ConnParams, ConnSide, Connection};
use crate::discovery::{NodeGroup, NodeRecord};
use crate::error::NetError;
use crate::frame::{DataKind, Frame, FrameKind};
use crate::handshake::ServerHandshake;
use crate::identity::{Identity, Role};
use crate::route::{
    ErrCode, MSG_CLIENT_OFFLINE, MSG_CLIENT_ONLINE, MsgType, RouteEnvelope, RouteHeader,
};
use crate::router::{DispatchOutcome, MessageRouter};
use crate::store::{ConnStore, StorePolicy};
use crate::transport::{self, TransportKind};

/// Payload of the presence notices a gate sends to nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPresence {
    pub user_id: u32,
    pub gate_id: u32,
    pub conn_id: u64,
    pub remote_addr: String,
}

/// Counters exposed by [`Gate::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub clients: usize,
    pub nodes: usize,
    pub forwarded: u64,
    pub route_failed: u64,
    pub dropped: u64,
    pub rejected_handshakes: u64,
}

/// Bound addresses after [`Gate::start`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateAddrs {
    pub client_tcp: Option<SocketAddr>,
    pub client_ws: Option<SocketAddr>,
    pub node: Option<SocketAddr>,
}

/// Which listener a connection came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client(TransportKind),
    Node,
}

impl Origin {
    fn transport(self) -> TransportKind {
        match self {
            Self::Client(kind) => kind,
            Self::Node => TransportKind::Tcp,
        }
    }
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    route_failed: AtomicU64,
    dropped: AtomicU64,
    rejected_handshakes: AtomicU64,
}

struct GateInner {
    config: GateConfig,
    identity: Identity,
    clients: ConnStore,
    nodes: ConnStore,
    node_group: Arc<NodeGroup>,
    router: MessageRouter,
    client_auth: Arc<dyn Authenticator>,
    node_auth: Arc<dyn Authenticator>,
    counters: Counters,
}

/// The gate process: listeners, stores and the forwarding rules.
pub struct Gate {
    inner: Arc<GateInner>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    addrs: GateAddrs,
}

impl Gate {
    pub fn new(
        config: GateConfig,
        client_auth: Arc<dyn Authenticator>,
        node_auth: Arc<dyn Authenticator>,
    ) -> Self {
        let identity = config.identity();
        let inner = Arc::new_cyclic(|weak: &Weak<GateInner>| {
            let on_client = weak.clone();
            let on_node = weak.clone();
            GateInner {
                identity,
                clients: ConnStore::new("clients", StorePolicy::SwapNewest).with_callback(Arc::new(
                    move |conn, enabled| {
                        if let Some(gate) = on_client.upgrade() {
                            gate.client_presence(conn, enabled);
                        }
                    },
                )),
                nodes: ConnStore::new("nodes", StorePolicy::RejectDuplicate).with_callback(Arc::new(
                    move |conn, enabled| {
                        if let Some(gate) = on_node.upgrade() {
                            gate.node_membership(conn, enabled);
                        }
                    },
                )),
                node_group: Arc::new(NodeGroup::new()),
                router: MessageRouter::new(identity),
                client_auth,
                node_auth,
                counters: Counters::default(),
                config,
            }
        });
        Self {
            inner,
            shutdown_tx: None,
            addrs: GateAddrs::default(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn local_addrs(&self) -> GateAddrs {
        self.addrs
    }

    /// Handlers for envelopes addressed to the gate itself.
    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn clients(&self) -> &ConnStore {
        &self.inner.clients
    }

    pub fn nodes(&self) -> &ConnStore {
        &self.inner.nodes
    }

    /// Nodes currently connected to this gate, by role.
    pub fn node_group(&self) -> &Arc<NodeGroup> {
        &self.inner.node_group
    }

    pub fn stats(&self) -> GateStats {
        let c = &self.inner.counters;
        GateStats {
            clients: self.inner.clients.len(),
            nodes: self.inner.nodes.len(),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            route_failed: c.route_failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            rejected_handshakes: c.rejected_handshakes.load(Ordering::Relaxed),
        }
    }

    /// Push an async message from the gate to a connected client.
    pub fn send_to_client<M: Message>(&self, user_id: u32, msg_id: u32, msg: &M) -> Result<(), NetError> {
        let target = Identity::client(user_id);
        let conn = self
            .inner
            .clients
            .load_by_identity(&target)
            .ok_or(NetError::RouteNotFound(target))?;
        let env = RouteEnvelope::new_async(self.inner.identity, target, msg_id, msg)?;
        conn.send_route(&env)
    }

    /// Bind the configured listeners and start accepting.
    pub async fn start(&mut self) -> Result<(), NetError> {
        if self.is_running() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let config = &inner.config;

        let mut listeners = Vec::new();
        if let Some(addr) = &config.client_tcp_addr {
            let listener = TcpListener::bind(addr).await?;
            self.addrs.client_tcp = Some(listener.local_addr()?);
            listeners.push((listener, Origin::Client(TransportKind::Tcp)));
        }
        if let Some(addr) = &config.client_ws_addr {
            let listener = TcpListener::bind(addr).await?;
            self.addrs.client_ws = Some(listener.local_addr()?);
            listeners.push((listener, Origin::Client(TransportKind::WebSocket)));
        }
        let listener = TcpListener::bind(&config.node_addr).await?;
        self.addrs.node = Some(listener.local_addr()?);
        listeners.push((listener, Origin::Node));

        let (shutdown_tx, _) = broadcast::channel(8);
        for (listener, origin) in listeners {
            let local = listener.local_addr()?;
            info!(gate = %self.inner.identity, ?origin, "Gate listening on {local}");
            tokio::spawn(accept_loop(
                Arc::clone(&self.inner),
                listener,
                origin,
                shutdown_tx.subscribe(),
            ));
        }
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop accepting and close every connection.
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = shutdown_tx.send(());
        self.inner.clients.close_all();
        self.inner.nodes.close_all();
        self.inner.router.correlator().cancel_all();
        info!(gate = %self.inner.identity, "Gate stopped");
    }
}

async fn accept_loop(
    gate: Arc<GateInner>,
    listener: TcpListener,
    origin: Origin,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => {
                        trace!(?origin, "Accepted socket from {remote}");
                        tokio::spawn(serve_socket(Arc::clone(&gate), stream, remote, origin));
                    }
                    Err(e) => error!(?origin, "Accept failed: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!(?origin, "Listener shutting down");
                break;
            }
        }
    }
}

/// Upgrade, handshake and register one accepted socket.
async fn serve_socket(gate: Arc<GateInner>, stream: TcpStream, remote: SocketAddr, origin: Origin) {
    let conn_config = gate.config.conn.clone();
    let kind = origin.transport();

    let upgrade = transport::accept(kind, stream, conn_config.max_body());
    let (mut reader, mut writer) =
        match tokio::time::timeout(conn_config.handshake_timeout, upgrade).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                debug!(%remote, "Transport setup failed: {e}");
                return;
            }
            Err(_) => {
                debug!(%remote, "Transport setup timed out");
                return;
            }
        };

    let authenticator = match origin {
        Origin::Client(_) => gate.client_auth.as_ref(),
        Origin::Node => gate.node_auth.as_ref(),
    };
    let mut handshake = ServerHandshake::new(authenticator, conn_config.handshake_timeout);
    let accepted = match handshake.run(&mut reader, &mut writer).await {
        Ok(accepted) => accepted,
        Err(e) => {
            gate.counters.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            warn!(%remote, ?origin, "Handshake rejected: {e}");
            writer.shutdown().await;
            return;
        }
    };

    let identity = match origin {
        Origin::Client(_) => Identity::client(accepted.identity.user_id),
        Origin::Node if accepted.identity.role.is_node() => accepted.identity,
        Origin::Node => {
            gate.counters.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            warn!(%remote, identity = %accepted.identity, "Non-node role on node listener");
            writer.shutdown().await;
            return;
        }
    };

    let handler = Arc::new(GateConnHandler {
        gate: Arc::downgrade(&gate),
        origin,
    });
    let conn = Connection::spawn(
        ConnParams {
            conn_id: accepted.conn_id,
            identity,
            side: ConnSide::Acceptor,
            transport: kind,
            remote_addr: remote,
        },
        conn_config,
        reader,
        writer,
        handler,
    );
    gate.store_for(origin).on_conn_enable(&conn, true);
}

/// A response may echo the unaddressed identity its request was sent to.
fn sender_matches(header: &RouteHeader, actual: Identity) -> bool {
    let claimed = header.from();
    claimed == actual
        || (header.msg_type == MsgType::Response
            && claimed.user_id == 0
            && claimed.role == actual.role)
}

struct GateConnHandler {
    gate: Weak<GateInner>,
    origin: Origin,
}

#[async_trait]
impl ConnHandler for GateConnHandler {
    async fn on_packet(&self, conn: &Arc<Connection>, frame: Frame) {
        if let Some(gate) = self.gate.upgrade() {
            gate.route(conn, self.origin, frame);
        }
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        if let Some(gate) = self.gate.upgrade() {
            gate.store_for(self.origin).on_conn_enable(conn, false);
        }
    }
}

impl GateInner {
    fn store_for(&self, origin: Origin) -> &ConnStore {
        match origin {
            Origin::Client(_) => &self.clients,
            Origin::Node => &self.nodes,
        }
    }

    fn route(&self, conn: &Arc<Connection>, origin: Origin, frame: Frame) {
        if frame.kind != FrameKind::Data(DataKind::Route) {
            warn!(conn_id = conn.conn_id(), kind = ?frame.kind, "Unexpected frame kind, dropped");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let env = match RouteEnvelope::decode(frame.body.clone()) {
            Ok(env) => env,
            Err(e) => {
                warn!(conn_id = conn.conn_id(), "Malformed route envelope, closing: {e}");
                conn.close();
                return;
            }
        };
        if !sender_matches(&env.header, conn.identity()) {
            warn!(
                conn_id = conn.conn_id(),
                claimed = %env.header.from(),
                actual = %conn.identity(),
                "Sender identity mismatch, dropped"
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let to = env.header.to();
        if to.role == Role::LOCAL || to == self.identity {
            self.dispatch_local(conn, env);
            return;
        }
        match origin {
            Origin::Node if to.role == Role::CLIENT => self.forward_to_client(frame, &env),
            _ => self.forward_to_node(conn, frame, &env),
        }
    }

    fn dispatch_local(&self, conn: &Arc<Connection>, env: RouteEnvelope) {
        let error = env.route_error(ErrCode::METHOD_NOT_FOUND);
        if self.router.dispatch(conn, env) == DispatchOutcome::NoHandler {
            self.counters.route_failed.fetch_add(1, Ordering::Relaxed);
            let _ = conn.send(Frame::route_fail(error.encode()));
        }
    }

    fn resolve_node(&self, to: Identity) -> Option<Arc<Connection>> {
        let user_id = if to.user_id != 0 {
            to.user_id
        } else {
            self.node_group.choose(to.role)?
        };
        self.nodes.load_by_identity(&Identity::new(user_id, to.role))
    }

    fn forward_to_node(&self, conn: &Arc<Connection>, frame: Frame, env: &RouteEnvelope) {
        let to = env.header.to();
        let Some(target) = self.resolve_node(to) else {
            self.counters.route_failed.fetch_add(1, Ordering::Relaxed);
            if env.header.msg_type == MsgType::Response {
                debug!(target = %to, syn = env.header.syn, "Response for a gone node dropped");
                return;
            }
            debug!(target = %to, msg_id = env.header.msg_id, "No node for envelope");
            let error = env.route_error(ErrCode::NODE_NOT_FOUND);
            let _ = conn.send(Frame::route_fail(error.encode()));
            return;
        };
        match target.send(frame) {
            Ok(()) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target = %target.identity(), "Forward to node failed: {e}");
            }
        }
    }

    fn forward_to_client(&self, frame: Frame, env: &RouteEnvelope) {
        let to = env.header.to();
        let Some(target) = self.clients.load_by_identity(&to) else {
            // The node already got the offline notice for this client.
            trace!(target = %to, "Client gone, envelope dropped");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match target.send(frame) {
            Ok(()) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target = %to, "Forward to client failed: {e}");
            }
        }
    }

    /// Tell every node that a client came or went.
    fn client_presence(&self, conn: &Arc<Connection>, online: bool) {
        let msg_id = if online { MSG_CLIENT_ONLINE } else { MSG_CLIENT_OFFLINE };
        let presence = Json(ClientPresence {
            user_id: conn.user_id(),
            gate_id: self.identity.user_id,
            conn_id: conn.conn_id(),
            remote_addr: conn.remote_addr().to_string(),
        });
        info!(client = %conn.identity(), conn_id = conn.conn_id(), online, "Client presence changed");
        self.nodes.range(|node| {
            match RouteEnvelope::new_async(conn.identity(), node.identity(), msg_id, &presence) {
                Ok(env) => {
                    if let Err(e) = node.send_route(&env) {
                        debug!(node = %node.identity(), "Presence notice not sent: {e}");
                    }
                }
                Err(e) => warn!("Presence notice encode failed: {e}"),
            }
            true
        });
    }

    fn node_membership(&self, conn: &Arc<Connection>, online: bool) {
        let identity = conn.identity();
        if online {
            info!(node = %identity, remote = %conn.remote_addr(), "Node joined");
            self.node_group
                .upsert(NodeRecord::new(identity, conn.remote_addr().to_string()));
        } else {
            info!(node = %identity, "Node left");
            self.node_group.remove(&identity);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
