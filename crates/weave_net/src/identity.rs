//! Endpoint identity: who sits at the other end of a connection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The kind of endpoint: client, gate, or an application-defined node role.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Role(pub u16);

impl Role {
    /// Addresses the receiving process itself.
    pub const LOCAL: Role = Role(0);
    /// A player client attached to a gate.
    pub const CLIENT: Role = Role(1);
    /// A gate process.
    pub const GATE: Role = Role(2);
    /// First role id available to application nodes.
    pub const FIRST_NODE: u16 = 16;

    /// Whether this role names an application node (game, chat, ...).
    pub fn is_node(self) -> bool {
        self.0 >= Self::FIRST_NODE
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LOCAL => write!(f, "local"),
            Self::CLIENT => write!(f, "client"),
            Self::GATE => write!(f, "gate"),
            Role(n) => write!(f, "role{n}"),
        }
    }
}

/// An authenticated endpoint: (user id, role).
///
/// For clients the user id is the player id; for nodes and gates it is the
/// node id. The pair is the key of every connection store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Identity {
    pub user_id: u32,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: u32, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn client(user_id: u32) -> Self {
        Self::new(user_id, Role::CLIENT)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.role)
    }
}

/// Process-unique id assigned to a connection by the accepting side.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next connection id. Never returns 0.
pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
