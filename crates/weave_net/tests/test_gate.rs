mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::*;
use tokio::sync::mpsc;
use weave_net::codec::Json;
use weave_net::gate::ClientPresence;
use weave_net::route::{MSG_CLIENT_OFFLINE, MSG_CLIENT_ONLINE};
use weave_net::{ConnStatus, Context, ErrCode, Identity, NetError, Role, TransportKind};

const ECHO: u32 = 100;
const WHO: u32 = 101;
const PUSH: u32 = 200;

#[tokio::test]
async fn client_handshake_reaches_connected_with_one_store_entry() {
    let gate = start_gate().await;
    let mut client = client(&gate, 100, TransportKind::Tcp);
    client.start().await.unwrap();

    assert_eq!(client.connected_gates(), 1);
    eventually("client stored", || gate.stats().clients == 1).await;
    let stored = gate.clients().load_by_identity(&Identity::client(100)).unwrap();
    assert_eq!(stored.status(), ConnStatus::Connected);
    assert_eq!(stored.role(), Role::CLIENT);
}

#[tokio::test]
async fn bad_client_token_is_rejected() {
    let gate = start_gate().await;
    // user-999 is not in the token table.
    let mut client = client(&gate, 999, TransportKind::Tcp);
    client.start().await.unwrap();

    assert_eq!(client.connected_gates(), 0);
    eventually("rejection counted", || gate.stats().rejected_handshakes == 1).await;
    assert_eq!(gate.stats().clients, 0);
}

#[tokio::test]
async fn request_to_missing_node_returns_node_not_found() {
    let gate = start_gate().await;
    let mut client = client(&gate, 101, TransportKind::Tcp);
    client.start().await.unwrap();

    let err = client
        .request::<(), ()>(Identity::new(0, LOBBY), ECHO, &())
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Remote(code) if code == ErrCode::NODE_NOT_FOUND.0));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(gate.stats().route_failed, 1);
}

#[tokio::test]
async fn local_request_without_handler_returns_method_not_found() {
    let gate = start_gate().await;
    let mut client = client(&gate, 102, TransportKind::Tcp);
    client.start().await.unwrap();

    let err = client
        .request::<(), ()>(Identity::new(0, Role::LOCAL), ECHO, &())
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Remote(code) if code == ErrCode::METHOD_NOT_FOUND.0));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn gate_local_handler_answers() {
    let gate = start_gate().await;
    gate.router()
        .register(Role::CLIENT, WHO, |ctx: Context, _: ()| async move {
            let _ = ctx.response(&Json(ctx.sender().user_id));
        });
    let mut client = client(&gate, 103, TransportKind::Tcp);
    client.start().await.unwrap();

    let Json(id): Json<u32> = client
        .request(Identity::new(0, Role::LOCAL), WHO, &())
        .await
        .unwrap();
    assert_eq!(id, 103);
}

#[tokio::test]
async fn client_request_reaches_node_and_back() {
    let gate = start_gate().await;
    let lobby = start_node(&gate, 1, LOBBY).await;
    lobby.on(Role::CLIENT, ECHO, |ctx: Context, Json(name): Json<String>| async move {
        let _ = ctx.response(&Json(format!("hello {name}")));
    });
    eventually("node stored", || gate.stats().nodes == 1).await;

    for transport in [TransportKind::Tcp, TransportKind::WebSocket] {
        let user_id = if transport == TransportKind::Tcp { 104 } else { 105 };
        let mut client = client(&gate, user_id, transport);
        client.start().await.unwrap();

        let Json(reply): Json<String> = client
            .request(Identity::new(0, LOBBY), ECHO, &Json("ada".to_string()))
            .await
            .unwrap();
        assert_eq!(reply, "hello ada");

        // Addressed directly by node id as well.
        let Json(reply): Json<String> = client
            .request(Identity::new(1, LOBBY), ECHO, &Json("bob".to_string()))
            .await
            .unwrap();
        assert_eq!(reply, "hello bob");
    }
    assert!(gate.stats().forwarded >= 8);
}

#[tokio::test]
async fn node_pushes_to_client_and_sees_presence() {
    let gate = start_gate().await;
    let lobby = start_node(&gate, 1, LOBBY).await;
    let (presence_tx, mut presence_rx) = mpsc::unbounded_channel();
    for msg_id in [MSG_CLIENT_ONLINE, MSG_CLIENT_OFFLINE] {
        let tx = presence_tx.clone();
        lobby.on(Role::CLIENT, msg_id, move |ctx: Context, Json(p): Json<ClientPresence>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((ctx.header().msg_id, p));
            }
        });
    }
    eventually("node stored", || gate.stats().nodes == 1).await;

    let mut client = client(&gate, 106, TransportKind::Tcp);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    client.on(LOBBY, PUSH, move |_ctx: Context, Json(text): Json<String>| {
        let tx = push_tx.clone();
        async move {
            let _ = tx.send(text);
        }
    });
    client.start().await.unwrap();

    let (msg_id, presence) = tokio::time::timeout(Duration::from_secs(5), presence_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg_id, MSG_CLIENT_ONLINE);
    assert_eq!(presence.user_id, 106);
    assert_eq!(presence.gate_id, 1);

    lobby
        .send_async(Identity::client(106), PUSH, &Json("welcome".to_string()))
        .unwrap();
    let text = tokio::time::timeout(Duration::from_secs(5), push_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text, "welcome");

    client.stop().await;
    let (msg_id, presence) = tokio::time::timeout(Duration::from_secs(5), presence_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg_id, MSG_CLIENT_OFFLINE);
    assert_eq!(presence.user_id, 106);

    // Pushing to a gone client is dropped at the gate, not reported back.
    let dropped = gate.stats().dropped;
    lobby
        .send_async(Identity::client(106), PUSH, &Json("late".to_string()))
        .unwrap();
    eventually("drop counted", || gate.stats().dropped == dropped + 1).await;
}

#[tokio::test]
async fn reconnecting_client_replaces_old_connection() {
    let gate = start_gate().await;
    let mut first = client(&gate, 107, TransportKind::Tcp);
    first.start().await.unwrap();
    eventually("first stored", || gate.stats().clients == 1).await;
    let old = gate.clients().load_by_identity(&Identity::client(107)).unwrap();

    let mut second = client(&gate, 107, TransportKind::Tcp);
    second.start().await.unwrap();
    eventually("old connection closed", || old.status() == ConnStatus::Closed).await;
    eventually("first client notices", || first.connected_gates() == 0).await;

    let current = gate.clients().load_by_identity(&Identity::client(107)).unwrap();
    assert_ne!(current.conn_id(), old.conn_id());
    assert_eq!(gate.stats().clients, 1);
    assert_eq!(second.connected_gates(), 1);
}

#[tokio::test]
async fn duplicate_node_id_is_rejected() {
    let gate = start_gate().await;
    let a = start_node(&gate, 3, LOBBY).await;
    eventually("node A stored", || gate.stats().nodes == 1).await;
    let stored = gate.nodes().load_by_identity(&Identity::new(3, LOBBY)).unwrap();

    let b = start_node(&gate, 3, LOBBY).await;
    eventually("node B dropped", || b.connected_gates() == 0).await;

    assert_eq!(a.connected_gates(), 1);
    assert_eq!(stored.status(), ConnStatus::Connected);
    assert_eq!(gate.stats().nodes, 1);
    assert_eq!(gate.node_group().node_ids(LOBBY), vec![3]);
    let current = gate.nodes().load_by_identity(&Identity::new(3, LOBBY)).unwrap();
    assert_eq!(current.conn_id(), stored.conn_id());
}

#[tokio::test]
async fn request_times_out_and_late_response_is_dropped() {
    let gate = start_gate().await;
    let slow = start_node(&gate, 4, BATTLE).await;
    slow.on(Role::CLIENT, ECHO, |ctx: Context, _: ()| async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        let _ = ctx.response(&());
    });
    eventually("node stored", || gate.stats().nodes == 1).await;

    let mut client = client(&gate, 108, TransportKind::Tcp);
    client.start().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = client
        .request_timeout::<(), ()>(Identity::new(4, BATTLE), ECHO, &(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(client.pending_requests(), 0);

    // The late response arrives and is ignored; the connection stays up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.connected_gates(), 1);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn unaddressed_requests_round_robin_across_nodes() {
    let gate = start_gate().await;
    let mut nodes = Vec::new();
    for id in [1u32, 2] {
        let node = start_node(&gate, id, LOBBY).await;
        node.on(Role::CLIENT, WHO, move |ctx: Context, _: ()| async move {
            let _ = ctx.response(&Json(id));
        });
        nodes.push(node);
    }
    eventually("both nodes stored", || gate.stats().nodes == 2).await;

    let mut client = client(&gate, 109, TransportKind::Tcp);
    client.start().await.unwrap();

    let mut hits: HashMap<u32, usize> = HashMap::new();
    let mut order = Vec::new();
    for _ in 0..4 {
        let Json(id): Json<u32> = client.request(Identity::new(0, LOBBY), WHO, &()).await.unwrap();
        *hits.entry(id).or_default() += 1;
        order.push(id);
    }
    assert_eq!(hits.get(&1), Some(&2));
    assert_eq!(hits.get(&2), Some(&2));
    assert_ne!(order[0], order[1]);
}

#[tokio::test]
async fn node_to_node_request_through_gate() {
    let gate = start_gate().await;
    let battle = start_node(&gate, 7, BATTLE).await;
    battle.on(LOBBY, ECHO, |ctx: Context, Json(n): Json<u64>| async move {
        let _ = ctx.response(&Json(n * 2));
    });
    let lobby = start_node(&gate, 1, LOBBY).await;
    eventually("both nodes stored", || gate.stats().nodes == 2).await;

    let Json(doubled): Json<u64> = lobby
        .request(Identity::new(7, BATTLE), ECHO, &Json(21u64))
        .await
        .unwrap();
    assert_eq!(doubled, 42);
}
