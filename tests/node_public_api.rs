//! Integration tests for the Node public API.
//!
//! Every test binds real TCP listeners on `127.0.0.1:0` and drives the full
//! stack: secure pipeline, routing table updates, lookups and broadcast.

use std::time::Duration;

use kadlink::{CipherSuite, Config, Identity, IdentityProof, Keypair, Node};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_millis(300);

async fn bind() -> Node {
    Node::bind("127.0.0.1:0").await.expect("bind failed")
}

fn addr(node: &Node) -> String {
    node.local_addr().to_string()
}

/// Poll `condition` until it holds or the test timeout expires.
async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let result = timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn node_bind_and_identity() {
    let node = bind().await;

    let identity = node.identity();
    assert_eq!(identity.to_hex().len(), 64);
    assert_eq!(node.keypair().identity(), identity);
    assert_eq!(node.contact().identity, identity);
    assert!(node.local_addr().port() > 0);
    assert!(node.routing_table().is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn dialing_inserts_peer_into_routing_table() {
    let a = bind().await;
    let b = bind().await;
    assert!(a.routing_table().is_empty());

    let contact = timeout(TEST_TIMEOUT, a.connect(&addr(&b)))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    assert_eq!(contact.identity, b.identity());
    assert_eq!(contact.addr, addr(&b));
    assert!(a.routing_table().exists(&b.identity()));
    wait_until("listener side to admit dialer", || b.routing_table().exists(&a.identity())).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn full_mesh_broadcast_delivers_exactly_once() {
    let nodes = vec![bind().await, bind().await, bind().await];
    for (i, j) in [(0, 1), (0, 2), (1, 2)] {
        timeout(TEST_TIMEOUT, nodes[i].connect(&addr(&nodes[j])))
            .await
            .expect("connect timed out")
            .expect("connect failed");
    }
    for node in &nodes {
        wait_until("full mesh", || node.connected_peers().len() == 2).await;
    }

    let mut inboxes = Vec::new();
    for node in &nodes {
        inboxes.push(node.messages().await.expect("inbox already taken"));
    }

    let sent = nodes[0].broadcast(b"hello mesh".to_vec()).await.unwrap();
    assert_eq!(sent, 2);

    for inbox in &mut inboxes[1..] {
        let msg = timeout(TEST_TIMEOUT, inbox.recv())
            .await
            .expect("broadcast not delivered")
            .expect("inbox closed");
        assert_eq!(msg.from, nodes[0].identity());
        assert_eq!(msg.payload, b"hello mesh");
        assert!(
            timeout(SHORT_TIMEOUT, inbox.recv()).await.is_err(),
            "broadcast delivered more than once"
        );
    }
    assert!(timeout(SHORT_TIMEOUT, inboxes[0].recv()).await.is_err());

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn find_node_walks_a_chain_of_peers() {
    let nodes = vec![bind().await, bind().await, bind().await, bind().await];
    for i in 0..3 {
        timeout(TEST_TIMEOUT, nodes[i].connect(&addr(&nodes[i + 1])))
            .await
            .expect("connect timed out")
            .expect("connect failed");
    }
    let first = &nodes[0];
    let last = &nodes[3];
    assert!(!first.routing_table().exists(&last.identity()));

    let found = timeout(TEST_TIMEOUT, first.find_node(last.identity()))
        .await
        .expect("lookup timed out");

    assert_eq!(found.first().map(|c| c.identity), Some(last.identity()));
    assert!(found.iter().all(|c| c.identity != first.identity()));
    assert!(first.routing_table().exists(&last.identity()));

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn bootstrap_discovers_peers_behind_seed() {
    let seed = bind().await;
    let existing = bind().await;
    timeout(TEST_TIMEOUT, existing.connect(&addr(&seed)))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let newcomer = bind().await;
    let found = timeout(TEST_TIMEOUT, newcomer.bootstrap(&addr(&seed)))
        .await
        .expect("bootstrap timed out")
        .expect("bootstrap failed");

    let ids: Vec<Identity> = found.iter().map(|c| c.identity).collect();
    assert!(ids.contains(&seed.identity()));
    assert!(ids.contains(&existing.identity()));
    assert!(newcomer.routing_table().exists(&existing.identity()));

    for node in [&seed, &existing, &newcomer] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn pow_policy_rejects_peer_without_proof() {
    const DIFFICULTY: u32 = 8;
    let guarded = Node::bind_with_config("127.0.0.1:0", Config::default().with_pow_difficulty(DIFFICULTY))
        .await
        .expect("bind failed");

    let keypair = loop {
        let candidate = Keypair::generate();
        if !candidate
            .identity()
            .verify_pow_with_difficulty(&IdentityProof::empty(), DIFFICULTY)
        {
            break candidate;
        }
    };
    let unproven = Node::bind_with("127.0.0.1:0", keypair, IdentityProof::empty(), Config::default())
        .await
        .expect("bind failed");

    // The dialer admits the guarded node; the guarded node then drops it.
    let _ = timeout(TEST_TIMEOUT, unproven.connect(&addr(&guarded))).await;
    wait_until("rejected link to close", || !unproven.is_connected(&guarded.identity())).await;
    assert!(!guarded.routing_table().exists(&unproven.identity()));
    assert!(guarded.connected_peers().is_empty());

    unproven.shutdown().await;
    guarded.shutdown().await;
}

#[tokio::test]
async fn pow_policy_admits_peer_with_proof() {
    let config = Config::default().with_pow_difficulty(6);
    let guarded = Node::bind_with_config("127.0.0.1:0", config.clone()).await.expect("bind failed");
    let proven = Node::bind_with_config("127.0.0.1:0", config).await.expect("bind failed");

    timeout(TEST_TIMEOUT, proven.connect(&addr(&guarded)))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    wait_until("guarded node to admit peer", || guarded.routing_table().exists(&proven.identity())).await;

    proven.shutdown().await;
    guarded.shutdown().await;
}

#[tokio::test]
async fn disconnect_removes_peer_on_both_sides() {
    let a = bind().await;
    let b = bind().await;
    timeout(TEST_TIMEOUT, a.connect(&addr(&b)))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    wait_until("listener side to admit dialer", || b.routing_table().exists(&a.identity())).await;

    assert!(a.disconnect(&b.identity()));
    wait_until("dialer to forget peer", || !a.routing_table().exists(&b.identity())).await;
    wait_until("listener to forget peer", || !b.routing_table().exists(&a.identity())).await;
    assert!(!a.disconnect(&b.identity()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn nodes_agree_on_non_default_cipher() {
    let config = Config::default().with_cipher(CipherSuite::Aes256Gcm);
    let a = Node::bind_with_config("127.0.0.1:0", config.clone()).await.unwrap();
    let b = Node::bind_with_config("127.0.0.1:0", config).await.unwrap();
    timeout(TEST_TIMEOUT, a.connect(&addr(&b)))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let mut inbox = b.messages().await.unwrap();
    wait_until("listener side to admit dialer", || b.is_connected(&a.identity())).await;
    assert_eq!(a.broadcast(b"sealed".to_vec()).await.unwrap(), 1);
    let msg = timeout(TEST_TIMEOUT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(msg.payload, b"sealed");

    a.shutdown().await;
    b.shutdown().await;
}
