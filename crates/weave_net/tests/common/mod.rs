#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use weave_net::auth::{SignedTokenAuthenticator, StaticAuthenticator};
use weave_net::{ConnConfig, Gate, GateConfig, Identity, Node, NodeConfig, Role, TransportKind};

pub const SECRET: &str = "cluster-secret";
pub const LOBBY: Role = Role(16);
pub const BATTLE: Role = Role(17);

pub fn conn_config() -> ConnConfig {
    ConnConfig {
        reconnect_delay: Duration::ZERO,
        handshake_timeout: Duration::from_secs(2),
        ..ConnConfig::default()
    }
}

/// A gate on ephemeral ports. Clients authenticate with `user-<id>`
/// tokens for ids 100..110, nodes with tokens signed by [`SECRET`].
pub async fn start_gate() -> Gate {
    let mut clients = StaticAuthenticator::new();
    for id in 100..110 {
        clients = clients.with_token(format!("user-{id}"), Identity::client(id));
    }
    let config = GateConfig {
        gate_id: 1,
        client_tcp_addr: Some("127.0.0.1:0".into()),
        client_ws_addr: Some("127.0.0.1:0".into()),
        node_addr: "127.0.0.1:0".into(),
        conn: conn_config(),
    };
    let mut gate = Gate::new(
        config,
        Arc::new(clients),
        Arc::new(SignedTokenAuthenticator::new(SECRET)),
    );
    gate.start().await.expect("gate start");
    gate
}

pub async fn start_node(gate: &Gate, node_id: u32, role: Role) -> Node {
    let addr = gate.local_addrs().node.expect("node listener").to_string();
    let mut node = Node::new(NodeConfig {
        node_id,
        role,
        gate_addrs: vec![addr],
        token_secret: SECRET.into(),
        request_timeout: Duration::from_secs(2),
        conn: conn_config(),
        ..NodeConfig::default()
    });
    node.start().await.expect("node start");
    node
}

/// A client with no handlers registered yet; call `start` on it.
pub fn client(gate: &Gate, user_id: u32, transport: TransportKind) -> Node {
    let addrs = gate.local_addrs();
    let addr = match transport {
        TransportKind::Tcp => addrs.client_tcp,
        TransportKind::WebSocket => addrs.client_ws,
    }
    .expect("client listener")
    .to_string();
    Node::new(NodeConfig {
        node_id: user_id,
        role: Role::CLIENT,
        gate_addrs: vec![addr],
        transport,
        token: Some(format!("user-{user_id}")),
        request_timeout: Duration::from_secs(2),
        conn: conn_config(),
        ..NodeConfig::default()
    })
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
