use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use weave_core::LoggingConfig;
use weave_net::{DiscoveryConfig, GateConfig, NodeConfig};

/// Everything the `weave` binary reads from its config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,

    /// Secret the gate verifies client tokens against. `weave token`
    /// signs with it.
    pub client_secret: String,

    /// Host advertised in discovery records when a listener is bound to
    /// an unspecified address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    pub gate: GateConfig,
    pub node: NodeConfig,

    /// Absent: no discovery, nodes dial `node.gate_addrs` only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            client_secret: String::new(),
            advertise_host: None,
            gate: GateConfig::default(),
            node: NodeConfig::default(),
            discovery: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        weave_core::load_or_default(path)
    }

    /// Gate startup needs both secrets.
    pub fn check_gate(&self) -> Result<()> {
        if self.client_secret.is_empty() {
            bail!("client_secret is not set");
        }
        self.check_node()
    }

    pub fn check_node(&self) -> Result<()> {
        if self.node.token_secret.is_empty() {
            bail!("node.token_secret is not set");
        }
        if !self.node.role.is_node() {
            bail!("node.role {} is not an application role", self.node.role);
        }
        Ok(())
    }

    /// Address other processes should dial for `bound`.
    pub fn advertised(&self, bound: SocketAddr) -> String {
        match &self.advertise_host {
            Some(host) if bound.ip().is_unspecified() => format!("{host}:{}", bound.port()),
            _ => bound.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
