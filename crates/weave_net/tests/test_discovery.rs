mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio::sync::broadcast;
use weave_net::discovery::{
    DiscoveryBackend, MemoryBackend, NodeGroup, NodeRecord, Registrar, RegistrationState, Watcher,
};
use weave_net::{Identity, Node, NodeConfig, Role};

const PREFIX: &str = "/weave/test/";

#[tokio::test]
async fn node_finds_gate_through_discovery() {
    let backend: Arc<dyn DiscoveryBackend> = Arc::new(MemoryBackend::new());
    let gate = start_gate().await;

    let node_addr = gate.local_addrs().node.unwrap().to_string();
    let mut registrar = Registrar::new(
        Arc::clone(&backend),
        PREFIX,
        NodeRecord::new(gate.identity(), node_addr.clone()),
        Duration::from_secs(10),
    );
    registrar.start().await.unwrap();
    assert_eq!(registrar.state(), RegistrationState::Registered);

    // A node with no static gates, fed only by discovery.
    let mut node = Node::new(NodeConfig {
        node_id: 5,
        role: LOBBY,
        gate_addrs: vec![],
        token_secret: SECRET.into(),
        conn: conn_config(),
        ..NodeConfig::default()
    });
    node.start().await.unwrap();

    let group = Arc::new(NodeGroup::new());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    Watcher::new(Arc::clone(&backend), PREFIX, Arc::clone(&group)).spawn(shutdown_rx);
    node.follow_gates(Arc::clone(&group));

    eventually("gate discovered", || group.choose(Role::GATE) == Some(1)).await;
    eventually("node connected", || node.connected_gates() == 1).await;
    eventually("gate sees node", || gate.stats().nodes == 1).await;
    assert_eq!(node.gate_addrs(), vec![node_addr.clone()]);

    // Deregistering the gate detaches the node from it.
    registrar.stop().await;
    eventually("gate forgotten", || group.is_empty()).await;
    eventually("node detached", || node.gate_addrs().is_empty()).await;
    eventually("gate drops node", || gate.stats().nodes == 0).await;

    let _ = shutdown_tx.send(());
    node.stop().await;
}

#[tokio::test]
async fn registered_nodes_are_chosen_round_robin() {
    let backend: Arc<dyn DiscoveryBackend> = Arc::new(MemoryBackend::new());
    let group = Arc::new(NodeGroup::new());
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    Watcher::new(Arc::clone(&backend), PREFIX, Arc::clone(&group)).spawn(shutdown_rx);

    let mut registrars = Vec::new();
    for id in 1..=3u32 {
        let mut registrar = Registrar::new(
            Arc::clone(&backend),
            PREFIX,
            NodeRecord::new(Identity::new(id, BATTLE), format!("10.0.0.{id}:7100")),
            Duration::from_secs(10),
        );
        registrar.start().await.unwrap();
        registrars.push(registrar);
    }
    eventually("three nodes", || group.node_ids(BATTLE).len() == 3).await;

    let mut picks: Vec<u32> = (0..3).filter_map(|_| group.choose(BATTLE)).collect();
    picks.sort_unstable();
    assert_eq!(picks, vec![1, 2, 3]);

    registrars[1].stop().await;
    eventually("node 2 removed", || group.node_ids(BATTLE).len() == 2).await;
    for _ in 0..6 {
        assert_ne!(group.choose(BATTLE), Some(2));
    }
    assert_eq!(group.choose(LOBBY), None);
}
