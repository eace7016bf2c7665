//! Command-line arguments for the `weave` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use weave_net::{Role, TransportKind};

use crate::config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "weave", version, about = "Gate and node processes of a game server cluster")]
pub struct Cli {
    /// Config file path (TOML, or JSON when it ends in `.json`).
    #[arg(short, long, value_name = "FILE", default_value = "weave.toml", global = true)]
    pub config: PathBuf,

    /// Log at debug level regardless of the configured filter.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a gate.
    Gate(GateArgs),
    /// Run a backend node with the demo echo handler.
    Node(NodeArgs),
    /// Run a gate and an echo node in one process, joined by in-memory discovery.
    Standalone(GateArgs),
    /// Connect as a client and send echo requests.
    Ping(PingArgs),
    /// Print a client token signed with `client_secret`.
    Token(TokenArgs),
    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct GateArgs {
    #[arg(long)]
    pub gate_id: Option<u32>,

    /// Client TCP listener address.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Client WebSocket listener address.
    #[arg(long, value_name = "ADDR")]
    pub ws_listen: Option<String>,

    /// Node listener address.
    #[arg(long, value_name = "ADDR")]
    pub node_listen: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct NodeArgs {
    #[arg(long)]
    pub node_id: Option<u32>,

    /// Application role id, 16 or above.
    #[arg(long)]
    pub role: Option<u16>,

    /// Gate node listener to dial; repeat for several gates.
    #[arg(long = "gate", value_name = "ADDR")]
    pub gates: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct PingArgs {
    /// Gate client listener address.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:7000")]
    pub gate: String,

    #[arg(long, default_value_t = 1000)]
    pub user_id: u32,

    /// Role of the node to ping.
    #[arg(long, default_value_t = Role::FIRST_NODE)]
    pub role: u16,

    /// Connect over WebSocket instead of TCP.
    #[arg(long)]
    pub ws: bool,

    #[arg(long, default_value_t = 3)]
    pub count: u32,

    /// Token to present; signed with `client_secret` when omitted.
    #[arg(long)]
    pub token: Option<String>,
}

impl PingArgs {
    pub fn transport(&self) -> TransportKind {
        if self.ws {
            TransportKind::WebSocket
        } else {
            TransportKind::Tcp
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct TokenArgs {
    #[arg(long)]
    pub user_id: u32,

    /// Token lifetime in seconds.
    #[arg(long, default_value_t = 86_400)]
    pub ttl_secs: u64,
}

impl GateArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(id) = self.gate_id {
            config.gate.gate_id = id;
        }
        if let Some(addr) = &self.listen {
            config.gate.client_tcp_addr = Some(addr.clone());
        }
        if let Some(addr) = &self.ws_listen {
            config.gate.client_ws_addr = Some(addr.clone());
        }
        if let Some(addr) = &self.node_listen {
            config.gate.node_addr = addr.clone();
        }
    }
}

impl NodeArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(id) = self.node_id {
            config.node.node_id = id;
        }
        if let Some(role) = self.role {
            config.node.role = Role(role);
        }
        if !self.gates.is_empty() {
            config.node.gate_addrs = self.gates.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
