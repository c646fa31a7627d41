//! End-to-end tests driving real nodes over the in-memory transport
//! fabric: store/get across peers, lookup convergence against a brute-force
//! oracle, opportunistic caching, write precedence and wire-level rejection
//! of tampered items.

use std::sync::Arc;
use std::time::Duration;

use sigilum::identity::distance_cmp;
use sigilum::messages::{Envelope, Payload};
use sigilum::{
    Config, Keypair, LookupError, MemoryNetwork, Node, NodeId, SignedItem, SystemClock, Transport,
    PROTOCOL_VERSION,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_config(k: usize) -> Config {
    Config {
        k,
        alpha: 3,
        request_timeout_ms: 500,
        lookup_deadline_ms: 3_000,
        reaper_interval_ms: 50,
        ..Config::default()
    }
}

fn spawn_with_keypair(
    network: &Arc<MemoryNetwork>,
    name: &str,
    keypair: Keypair,
    config: Config,
) -> Node {
    let (transport, inbound) = network.register(name);
    Node::spawn(
        keypair,
        name,
        vec![],
        config,
        Arc::new(SystemClock::new()),
        transport,
        inbound,
    )
}

fn spawn(network: &Arc<MemoryNetwork>, name: &str, config: Config) -> Node {
    spawn_with_keypair(network, name, Keypair::generate(), config)
}

/// Spin up `count` nodes, join them through the first one, then run one
/// stabilization round so neighborhoods are mutually known.
async fn spawn_mesh(network: &Arc<MemoryNetwork>, count: usize, k: usize) -> Vec<Node> {
    let mut nodes = Vec::new();
    for i in 0..count {
        nodes.push(spawn(network, &format!("node-{}", i), fast_config(k)));
    }
    let hub = nodes[0].contact();
    for node in &nodes[1..] {
        timeout(TEST_TIMEOUT, node.join(&[hub.clone()]))
            .await
            .expect("join timed out")
            .expect("join failed");
    }
    for node in &nodes {
        let _ = timeout(TEST_TIMEOUT, node.find_node(node.id())).await;
    }
    nodes
}

#[tokio::test]
async fn two_node_store_and_get() {
    let network = MemoryNetwork::new();
    let publisher_keys = Keypair::generate();
    let publisher_public = publisher_keys.public_key_bytes();

    let n1 = spawn_with_keypair(&network, "n1", publisher_keys, fast_config(8));
    let n2 = spawn(&network, "n2", fast_config(8));

    timeout(TEST_TIMEOUT, n2.join(&[n1.contact()]))
        .await
        .expect("join timed out")
        .expect("join failed");

    let report = timeout(
        TEST_TIMEOUT,
        n1.set("greeting", b"hello".to_vec(), 0, vec![]),
    )
    .await
    .expect("set timed out")
    .expect("set failed");
    assert_eq!(report.accepted, vec![n2.id()]);
    assert!(report.rejected.is_empty());

    let item = timeout(TEST_TIMEOUT, n2.get("greeting", &publisher_public))
        .await
        .expect("get timed out")
        .expect("get failed");
    assert_eq!(item.value, b"hello");
    assert_eq!(item.name, "greeting");
    assert_eq!(item.public_key, publisher_public);
}

#[tokio::test]
async fn lookup_converges_to_brute_force_neighbors() {
    let network = MemoryNetwork::new();
    let nodes = spawn_mesh(&network, 12, 4).await;
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id()).collect();

    for (round, querier) in nodes.iter().enumerate().take(6) {
        let target = NodeId::hash_of(&[b't', round as u8]);
        let found = timeout(TEST_TIMEOUT, querier.find_node(target))
            .await
            .expect("lookup timed out")
            .expect("lookup failed");

        // Brute-force K nearest over the whole population, minus the
        // querier itself (peers never return the requester).
        let mut expected: Vec<NodeId> = ids
            .iter()
            .copied()
            .filter(|id| *id != querier.id())
            .collect();
        expected.sort_by(|a, b| distance_cmp(&a.distance(&target), &b.distance(&target)));
        expected.truncate(4);

        let found_ids: Vec<NodeId> = found.iter().map(|c| c.id).collect();
        assert_eq!(found_ids, expected, "round {}", round);
    }
}

#[tokio::test]
async fn get_surfaces_value_not_found() {
    let network = MemoryNetwork::new();
    let nodes = spawn_mesh(&network, 4, 4).await;

    let stranger = Keypair::generate();
    let result = timeout(
        TEST_TIMEOUT,
        nodes[1].get("never published", &stranger.public_key_bytes()),
    )
    .await
    .expect("get timed out");
    assert_eq!(result.err(), Some(LookupError::ValueNotFound));
}

#[tokio::test]
async fn lonely_node_reports_no_peers() {
    let network = MemoryNetwork::new();
    let node = spawn(&network, "alone", fast_config(4));

    let publisher = Keypair::generate();
    let result = node.get("anything", &publisher.public_key_bytes()).await;
    assert_eq!(result.err(), Some(LookupError::NoPeers));
}

#[tokio::test]
async fn popular_values_spread_to_non_holders() {
    let network = MemoryNetwork::new();
    let nodes = spawn_mesh(&network, 10, 2).await;

    let report = timeout(
        TEST_TIMEOUT,
        nodes[0].set("popular", b"payload".to_vec(), 0, vec![]),
    )
    .await
    .expect("set timed out")
    .expect("set failed");
    assert!(!report.accepted.is_empty());

    let mut baseline = 0;
    for node in &nodes {
        baseline += node.snapshot().await.items;
    }

    // Distant nodes fetch the value; each successful traversal pushes a
    // cache copy to the closest peer seen without one.
    let publisher_public = {
        let item = timeout(
            TEST_TIMEOUT,
            nodes[9].get("popular", &nodes[0].public_key()),
        )
        .await
        .expect("get timed out")
        .expect("get failed");
        assert_eq!(item.value, b"payload");
        item.public_key
    };

    let mut spread = 0;
    'outer: for reader in [8, 7, 6, 5] {
        let _ = timeout(
            TEST_TIMEOUT,
            nodes[reader].get("popular", &publisher_public),
        )
        .await;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let mut total = 0;
            for node in &nodes {
                total += node.snapshot().await.items;
            }
            if total > baseline {
                spread = total;
                break 'outer;
            }
        }
    }
    assert!(
        spread > baseline,
        "no cache copy appeared beyond the original holders"
    );
}

#[tokio::test]
async fn later_write_wins_everywhere() {
    let network = MemoryNetwork::new();
    let nodes = spawn_mesh(&network, 6, 4).await;

    timeout(TEST_TIMEOUT, nodes[1].set("doc", b"v1".to_vec(), 0, vec![]))
        .await
        .expect("set timed out")
        .expect("first set failed");
    // Distinct wall-clock timestamp for the second write.
    tokio::time::sleep(Duration::from_millis(5)).await;
    timeout(TEST_TIMEOUT, nodes[1].set("doc", b"v2".to_vec(), 0, vec![]))
        .await
        .expect("set timed out")
        .expect("second set failed");

    for reader in [2, 4, 5] {
        let item = timeout(
            TEST_TIMEOUT,
            nodes[reader].get("doc", &nodes[1].public_key()),
        )
        .await
        .expect("get timed out")
        .expect("get failed");
        assert_eq!(item.value, b"v2", "reader {}", reader);
    }
}

#[tokio::test]
async fn tampered_item_rejected_at_the_wire() {
    let network = MemoryNetwork::new();
    let node = spawn(&network, "honest", fast_config(4));

    // A bare client speaking the wire protocol directly.
    let mallory = Keypair::generate();
    let (client, mut client_rx) = network.register("mallory");

    let mut item = SignedItem::build(
        &mallory,
        "forged",
        b"original".to_vec(),
        0,
        vec![],
        PROTOCOL_VERSION,
        now_wall_ms(),
    )
    .expect("build");
    item.value[0] ^= 0x01;

    let envelope = Envelope::seal(
        &mallory,
        [9u8; 16],
        PROTOCOL_VERSION,
        0,
        Payload::Store(item),
    )
    .expect("seal");
    client
        .send("honest", envelope.encode().expect("encode"))
        .await
        .expect("send");

    let (_, frame) = timeout(TEST_TIMEOUT, client_rx.recv())
        .await
        .expect("reply timed out")
        .expect("fabric closed");
    let reply = Envelope::decode(&frame).expect("decode reply");
    match reply.payload {
        Payload::StoreErr { reason } => assert!(reason.contains("signature")),
        other => panic!("expected StoreErr, got {:?}", other),
    }
    assert_eq!(node.snapshot().await.items, 0);
}

#[tokio::test]
async fn join_requires_seeds() {
    let network = MemoryNetwork::new();
    let node = spawn(&network, "seedless", fast_config(4));
    assert!(node.join(&[]).await.is_err());
}

#[tokio::test]
async fn join_populates_both_sides() {
    let network = MemoryNetwork::new();
    let a = spawn(&network, "a", fast_config(4));
    let b = spawn(&network, "b", fast_config(4));

    timeout(TEST_TIMEOUT, b.join(&[a.contact()]))
        .await
        .expect("join timed out")
        .expect("join failed");

    assert_eq!(a.snapshot().await.contacts, 1);
    assert_eq!(b.snapshot().await.contacts, 1);
}

#[tokio::test]
async fn leave_stops_serving() {
    let network = MemoryNetwork::new();
    let a = spawn(&network, "a", fast_config(4));
    let b = spawn(&network, "b", fast_config(4));
    timeout(TEST_TIMEOUT, b.join(&[a.contact()]))
        .await
        .expect("join timed out")
        .expect("join failed");

    b.leave().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = b.snapshot().await;
    assert_eq!(snapshot.contacts, 0);
    assert_eq!(snapshot.pending_requests, 0);

    let publisher = Keypair::generate();
    assert!(b.get("x", &publisher.public_key_bytes()).await.is_err());
}

fn now_wall_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
