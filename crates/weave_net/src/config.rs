//! Fabric configuration: connection tuning, gate, node, and discovery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::MAX_BODY_LEN;
use crate::identity::{Identity, Role};
use crate::transport::TransportKind;

/// Per-connection tuning shared by gates and nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Idle interval after which the dialing side sends a heartbeat.
    /// A connection with no inbound traffic for twice this long is closed.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Depth of the bounded outbound queue.
    pub send_queue_depth: usize,

    /// Largest accepted frame body. Values above the wire maximum are
    /// clamped by [`ConnConfig::max_body`].
    pub max_body_len: usize,

    /// Deadline for each handshake step.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Fixed delay between reconnect attempts. Zero disables reconnect.
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            send_queue_depth: 10,
            max_body_len: MAX_BODY_LEN,
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl ConnConfig {
    /// No inbound traffic for this long closes the connection.
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }

    /// Effective body cap: the configured value, never above the wire maximum.
    pub fn max_body(&self) -> usize {
        self.max_body_len.min(MAX_BODY_LEN)
    }

    pub fn reconnect_enabled(&self) -> bool {
        !self.reconnect_delay.is_zero()
    }
}

/// Gate listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Node id of this gate.
    pub gate_id: u32,

    /// TCP listener for player clients.
    pub client_tcp_addr: Option<String>,

    /// WebSocket listener for player clients.
    pub client_ws_addr: Option<String>,

    /// TCP listener for backend nodes.
    pub node_addr: String,

    pub conn: ConnConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            gate_id: 1,
            client_tcp_addr: Some("0.0.0.0:7000".to_string()),
            client_ws_addr: Some("0.0.0.0:7001".to_string()),
            node_addr: "0.0.0.0:7100".to_string(),
            conn: ConnConfig::default(),
        }
    }
}

impl GateConfig {
    pub fn identity(&self) -> Identity {
        Identity::new(self.gate_id, Role::GATE)
    }
}

/// Backend node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: u32,

    /// Application role of this node; must be at least `Role::FIRST_NODE`.
    pub role: Role,

    /// Gate node listeners dialed at startup.
    pub gate_addrs: Vec<String>,

    pub transport: TransportKind,

    /// Secret shared with gates for signing node tokens.
    pub token_secret: String,

    /// Fixed token presented instead of a signed one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Lifetime of the token presented to gates.
    #[serde(with = "duration_ms")]
    pub token_ttl: Duration,

    /// Default deadline for requests issued by this node.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    pub conn: ConnConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            role: Role(Role::FIRST_NODE),
            gate_addrs: vec!["127.0.0.1:7100".to_string()],
            transport: TransportKind::Tcp,
            token_secret: String::new(),
            token: None,
            token_ttl: Duration::from_secs(24 * 3600),
            request_timeout: Duration::from_secs(5),
            conn: ConnConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn identity(&self) -> Identity {
        Identity::new(self.node_id, self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryBackendKind {
    /// In-process registry, for tests and single-process deployments.
    #[default]
    Memory,
    /// etcd v3 through its JSON gateway.
    Etcd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub backend: DiscoveryBackendKind,

    /// etcd gateway endpoints, e.g. `http://127.0.0.1:2379`.
    pub endpoints: Vec<String>,

    /// Key prefix under which registration records live.
    pub prefix: String,

    #[serde(with = "duration_ms")]
    pub lease_ttl: Duration,

    /// Timeout for unary backend calls.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: DiscoveryBackendKind::Memory,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "/weave/nodes/".to_string(),
            lease_ttl: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
