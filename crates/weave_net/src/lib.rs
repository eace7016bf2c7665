//! Weave Net: the communication fabric of a game server cluster.
//!
//! Clients and backend nodes hold long-lived connections to gates. Every
//! connection carries length-prefixed frames; data frames carry a route
//! envelope naming a source and a destination identity, which the gate
//! relays without rewriting.
//!
//! # Architecture
//!
//! - **Framing**: 4-byte header (kind, sub kind, u16 LE length) plus body,
//!   over raw TCP or one frame per WebSocket binary message.
//! - **Connection**: control handshake binding an identity, heartbeat and
//!   idle timeout, a bounded non-blocking send queue.
//! - **Routing**: 24-byte route header, handler table keyed by
//!   `(sender role, msg id)`, and a correlator pairing responses with
//!   requests.
//! - **Gate**: client and node stores with one live connection per
//!   identity, forwarding rules and presence notices.
//! - **Discovery**: lease-backed node records (in-memory or etcd) mirrored
//!   into a round-robin [`NodeGroup`](discovery::NodeGroup).
//!
//! # Ordering
//!
//! Frames sent on one connection arrive in send order, and a gate forwards
//! envelopes from one source connection in arrival order. Handlers are a
//! different matter: each envelope's handler runs on its own task, so two
//! async messages from the same connection may be handled concurrently
//! and finish in either order. Handlers that need per-sender ordering must
//! sequence the work themselves, e.g. by feeding a channel.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weave_net::{Gate, GateConfig, Node, NodeConfig, Role};
//! use weave_net::auth::SignedTokenAuthenticator;
//! use weave_net::codec::Json;
//!
//! # async fn example() -> Result<(), weave_net::NetError> {
//! let auth = Arc::new(SignedTokenAuthenticator::new("secret"));
//! let mut gate = Gate::new(GateConfig::default(), auth.clone(), auth);
//! gate.start().await?;
//!
//! let mut node = Node::new(NodeConfig {
//!     token_secret: "secret".into(),
//!     ..NodeConfig::default()
//! });
//! node.on(Role::CLIENT, 100, |ctx, Json(name): Json<String>| async move {
//!     let _ = ctx.response(&Json(format!("hello {name}")));
//! });
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod conn;
pub mod connector;
pub mod correlator;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod gate;
pub mod handshake;
pub mod identity;
pub mod node;
pub mod route;
pub mod router;
pub mod store;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{ConnConfig, DiscoveryConfig, GateConfig, NodeConfig};
pub use conn::{ConnStatus, Connection};
pub use connector::{Connector, ConnectorParams};
pub use error::NetError;
pub use frame::Frame;
pub use gate::{Gate, GateStats};
pub use identity::{ConnId, Identity, Role};
pub use node::Node;
pub use route::{ErrCode, MsgType, RouteEnvelope, RouteHeader};
pub use router::{Context, MessageRouter};
pub use store::{ConnStore, StorePolicy};
pub use transport::TransportKind;
