//! Process wiring for each subcommand: config to gate/node, discovery,
//! shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use weave_net::auth::{SignedTokenAuthenticator, TokenSigner};
use weave_net::codec::Json;
use weave_net::discovery::{
    self, DiscoveryBackend, MemoryBackend, NodeGroup, NodeRecord, Registrar, Watcher,
};
use weave_net::gate::ClientPresence;
use weave_net::route::{MSG_CLIENT_OFFLINE, MSG_CLIENT_ONLINE};
use weave_net::{
    ConnConfig, Context, DiscoveryConfig, Gate, Identity, Node, NodeConfig, Role,
};

use crate::cli::{PingArgs, TokenArgs};
use crate::config::AppConfig;

/// Message id of the demo echo request.
pub const ECHO: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoRequest {
    pub seq: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoReply {
    pub seq: u32,
    pub text: String,
    pub node_id: u32,
}

/// Answer client echo requests and log client presence.
pub fn install_echo(node: &Node) {
    let node_id = node.identity().user_id;
    node.on(Role::CLIENT, ECHO, move |ctx: Context, Json(req): Json<EchoRequest>| async move {
        let reply = EchoReply {
            seq: req.seq,
            text: req.text,
            node_id,
        };
        if let Err(e) = ctx.response(&Json(reply)) {
            warn!(to = %ctx.sender(), "Echo reply not sent: {e}");
        }
    });
    node.on(Role::CLIENT, MSG_CLIENT_ONLINE, |_ctx: Context, Json(p): Json<ClientPresence>| async move {
        info!(user_id = p.user_id, gate_id = p.gate_id, addr = %p.remote_addr, "Client online");
    });
    node.on(Role::CLIENT, MSG_CLIENT_OFFLINE, |_ctx: Context, Json(p): Json<ClientPresence>| async move {
        info!(user_id = p.user_id, gate_id = p.gate_id, "Client offline");
    });
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

async fn start_gate(config: &AppConfig) -> Result<Gate> {
    let client_auth = Arc::new(SignedTokenAuthenticator::new(config.client_secret.clone()));
    let node_auth = Arc::new(SignedTokenAuthenticator::new(config.node.token_secret.clone()));
    let mut gate = Gate::new(config.gate.clone(), client_auth, node_auth);
    gate.start().await.context("Failed to start gate")?;
    Ok(gate)
}

/// Publish the gate's node listener so nodes can find it.
async fn register_gate(
    config: &AppConfig,
    gate: &Gate,
    backend: Arc<dyn DiscoveryBackend>,
    discovery: &DiscoveryConfig,
) -> Result<Registrar> {
    let addrs = gate.local_addrs();
    let node_addr = addrs.node.context("Gate has no node listener")?;
    let mut record = NodeRecord::new(gate.identity(), config.advertised(node_addr));
    record.ws_addr = addrs.client_ws.map(|a| config.advertised(a));

    let mut registrar = Registrar::new(backend, &discovery.prefix, record, discovery.lease_ttl);
    registrar.start().await.context("Failed to register gate")?;
    info!(key = registrar.key(), "Gate registered");
    Ok(registrar)
}

/// Register the node and keep its gate set in step with discovery.
async fn join_discovery(
    node: &Node,
    backend: Arc<dyn DiscoveryBackend>,
    discovery: &DiscoveryConfig,
    shutdown: &broadcast::Sender<()>,
) -> Result<Registrar> {
    let group = Arc::new(NodeGroup::new());
    Watcher::new(Arc::clone(&backend), discovery.prefix.clone(), Arc::clone(&group))
        .spawn(shutdown.subscribe());
    node.follow_gates(group);

    // Nodes accept no inbound connections, so the record carries no address.
    let record = NodeRecord::new(node.identity(), String::new());
    let mut registrar = Registrar::new(backend, &discovery.prefix, record, discovery.lease_ttl);
    registrar.start().await.context("Failed to register node")?;
    info!(key = registrar.key(), "Node registered");
    Ok(registrar)
}

async fn stop_registrars(registrars: &mut [Registrar]) {
    for registrar in registrars.iter_mut() {
        registrar.stop().await;
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

pub async fn run_gate(config: AppConfig) -> Result<()> {
    config.check_gate()?;
    let shutdown = weave_core::shutdown_channel();
    let mut stop = shutdown.subscribe();

    let mut gate = start_gate(&config).await?;
    let mut registrars = Vec::new();
    if let Some(discovery) = &config.discovery {
        let backend = discovery::build_backend(discovery)?;
        registrars.push(register_gate(&config, &gate, backend, discovery).await?);
    }

    let _ = stop.recv().await;
    info!("Shutting down gate");
    stop_registrars(&mut registrars).await;
    gate.stop().await;
    Ok(())
}

pub async fn run_node(config: AppConfig) -> Result<()> {
    config.check_node()?;
    let shutdown = weave_core::shutdown_channel();
    let mut stop = shutdown.subscribe();

    let mut node = Node::new(config.node.clone());
    install_echo(&node);
    node.start().await.context("Failed to start node")?;

    let mut registrars = Vec::new();
    if let Some(discovery) = &config.discovery {
        let backend = discovery::build_backend(discovery)?;
        registrars.push(join_discovery(&node, backend, discovery, &shutdown).await?);
    }

    let _ = stop.recv().await;
    info!("Shutting down node");
    stop_registrars(&mut registrars).await;
    node.stop().await;
    Ok(())
}

/// A gate and an echo node sharing an in-memory registry.
pub struct Standalone {
    pub gate: Gate,
    pub node: Node,
    registrars: Vec<Registrar>,
    shutdown: broadcast::Sender<()>,
}

impl Standalone {
    pub async fn start(config: &AppConfig, shutdown: broadcast::Sender<()>) -> Result<Self> {
        config.check_gate()?;
        let discovery = config.discovery.clone().unwrap_or_default();
        let backend: Arc<dyn DiscoveryBackend> = Arc::new(MemoryBackend::new());

        let gate = start_gate(config).await?;
        let mut registrars = vec![register_gate(config, &gate, Arc::clone(&backend), &discovery).await?];

        // The node learns the gate address from discovery only.
        let mut node = Node::new(NodeConfig {
            gate_addrs: Vec::new(),
            ..config.node.clone()
        });
        install_echo(&node);
        node.start().await.context("Failed to start node")?;
        registrars.push(join_discovery(&node, backend, &discovery, &shutdown).await?);

        Ok(Self {
            gate,
            node,
            registrars,
            shutdown,
        })
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(());
        stop_registrars(&mut self.registrars).await;
        self.node.stop().await;
        self.gate.stop().await;
    }
}

pub async fn run_standalone(config: AppConfig) -> Result<()> {
    let shutdown = weave_core::shutdown_channel();
    let mut stop = shutdown.subscribe();
    let cluster = Standalone::start(&config, shutdown).await?;
    info!(
        gate = %cluster.gate.identity(),
        node = %cluster.node.identity(),
        "Standalone cluster running"
    );

    let _ = stop.recv().await;
    info!("Shutting down standalone cluster");
    cluster.stop().await;
    Ok(())
}

fn client_token(config: &AppConfig, user_id: u32, ttl: Duration) -> Result<String> {
    if config.client_secret.is_empty() {
        bail!("client_secret is not set");
    }
    Ok(TokenSigner::new(config.client_secret.clone()).sign(Identity::client(user_id), ttl))
}

pub fn run_token(config: &AppConfig, args: &TokenArgs) -> Result<()> {
    let token = client_token(config, args.user_id, Duration::from_secs(args.ttl_secs))?;
    println!("{token}");
    Ok(())
}

pub async fn run_ping(config: &AppConfig, args: &PingArgs) -> Result<()> {
    let token = match &args.token {
        Some(token) => token.clone(),
        None => client_token(config, args.user_id, Duration::from_secs(3600))?,
    };
    let mut client = Node::new(NodeConfig {
        node_id: args.user_id,
        role: Role::CLIENT,
        gate_addrs: vec![args.gate.clone()],
        transport: args.transport(),
        token: Some(token),
        request_timeout: config.node.request_timeout,
        conn: ConnConfig {
            reconnect_delay: Duration::ZERO,
            ..config.node.conn.clone()
        },
        ..NodeConfig::default()
    });
    client.start().await?;
    if client.connected_gates() == 0 {
        client.stop().await;
        bail!("Could not connect to {}", args.gate);
    }

    let target = Identity::new(0, Role(args.role));
    for seq in 0..args.count {
        let started = Instant::now();
        let request = Json(EchoRequest {
            seq,
            text: "ping".to_string(),
        });
        match client.request::<_, Json<EchoReply>>(target, ECHO, &request).await {
            Ok(Json(reply)) => println!(
                "seq={} node={} time={:?}",
                reply.seq,
                reply.node_id,
                started.elapsed()
            ),
            Err(e) => println!("seq={seq} error: {e}"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    client.stop().await;
    Ok(())
}

pub fn run_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    weave_core::save_to_file(&AppConfig::default(), path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
