//! # Iterative Node Lookup
//!
//! Disjoint-path `FindNode` over a [`LookupRpc`] network.
//!
//! ## Algorithm
//!
//! 1. Seed with the `alpha` closest known peers, mark them visited (our own
//!    identity is visited from the start) and deal them round-robin across
//!    `disjoint_paths` frontiers.
//! 2. Every frontier runs concurrently. It pops up to `alpha` queued peers,
//!    queries them in parallel with a per-query timeout and waits for the
//!    whole batch before issuing the next one.
//! 3. Each returned contact not yet visited is claimed for the frontier in
//!    the same critical section that marks it visited, so no two frontiers
//!    ever expand the same peer.
//! 4. A frontier stops once its queue is empty and nothing is in flight.
//! 5. All frontiers plus the seeds are merged, sorted by XOR distance and
//!    truncated to `K`.
//!
//! A failed, timed-out or malformed query contributes nothing; the lookup
//! carries on with the remaining peers and always returns.
//!
//! Contacts are only re-queued while they can still improve the frontier's
//! best `K`, which keeps a frontier from walking the entire network.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::config::Config;
use crate::identity::{distance_cmp, Contact, Identity, IDENTITY_LEN};
use crate::protocols::LookupRpc;
use crate::routing::RoutingTable;

/// Upper bound on batches a single frontier issues.
const MAX_FRONTIER_ROUNDS: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub disjoint_paths: usize,
    pub query_timeout: Duration,
}

impl From<&Config> for LookupParams {
    fn from(config: &Config) -> Self {
        Self {
            k: config.bucket_size,
            alpha: config.alpha,
            disjoint_paths: config.disjoint_paths,
            query_timeout: config.lookup_timeout,
        }
    }
}

#[derive(Debug, Default)]
struct LookupFrontier {
    pending: usize,
    queue: VecDeque<Contact>,
    found: Vec<Contact>,
}

impl LookupFrontier {
    /// Distance of the `k`-th closest contact this frontier has found.
    fn kth_distance(&self, target: &Identity, k: usize) -> Option<[u8; IDENTITY_LEN]> {
        if self.found.len() < k {
            return None;
        }
        let mut distances: Vec<_> = self.found.iter().map(|c| c.distance_to(target)).collect();
        distances.sort_by(distance_cmp);
        distances.get(k - 1).copied()
    }
}

pub struct DhtNode<N: LookupRpc> {
    id: Identity,
    routing: Arc<RoutingTable>,
    network: Arc<N>,
    params: LookupParams,
}

impl<N: LookupRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            routing: self.routing.clone(),
            network: self.network.clone(),
            params: self.params,
        }
    }
}

impl<N: LookupRpc> DhtNode<N> {
    pub fn new(routing: Arc<RoutingTable>, network: N, params: LookupParams) -> Self {
        Self {
            id: routing.self_id(),
            routing,
            network: Arc::new(network),
            params: LookupParams {
                k: params.k.max(1),
                alpha: params.alpha.max(1),
                disjoint_paths: params.disjoint_paths.max(1),
                query_timeout: params.query_timeout,
            },
        }
    }

    pub fn identity(&self) -> Identity {
        self.id
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn params(&self) -> LookupParams {
        self.params
    }

    /// Serve a lookup: up to `K` closest contacts, never including the requester.
    pub fn handle_lookup_request(&self, from: &Identity, target: Identity) -> Vec<Contact> {
        let mut closest = self.routing.closest_peers(&target, self.params.k + 1);
        closest.retain(|c| &c.identity != from);
        closest.truncate(self.params.k);
        closest
    }

    /// Find the `K` contacts closest to `target`.
    pub async fn find_node(&self, target: Identity) -> Vec<Contact> {
        self.lookup(target, None).await
    }

    /// Look up our own identity starting from `seed`, populating the routing
    /// table from the responders.
    pub async fn bootstrap(&self, seed: Contact) -> Vec<Contact> {
        self.lookup(self.id, Some(seed)).await
    }

    async fn lookup(&self, target: Identity, extra_seed: Option<Contact>) -> Vec<Contact> {
        let started = Instant::now();
        let LookupParams { k, alpha, disjoint_paths, .. } = self.params;

        let mut seeds = self.routing.closest_peers(&target, alpha);
        if let Some(seed) = extra_seed
            && seed.identity != self.id
            && !seeds.contains(&seed)
        {
            seeds.push(seed);
        }

        let visited = {
            let mut visited = HashSet::with_capacity(k * disjoint_paths + seeds.len() + 1);
            visited.insert(self.id);
            visited.extend(seeds.iter().map(|c| c.identity));
            Arc::new(Mutex::new(visited))
        };

        let mut frontiers: Vec<LookupFrontier> =
            (0..disjoint_paths).map(|_| LookupFrontier::default()).collect();
        for (i, seed) in seeds.iter().enumerate() {
            frontiers[i % disjoint_paths].queue.push_back(seed.clone());
        }

        let mut paths = JoinSet::new();
        for (path, frontier) in frontiers.into_iter().enumerate() {
            if frontier.queue.is_empty() {
                continue;
            }
            let engine = self.clone();
            let visited = visited.clone();
            paths.spawn(async move { engine.run_frontier(path, target, frontier, visited).await });
        }

        let mut merged = seeds;
        while let Some(joined) = paths.join_next().await {
            if let Ok(found) = joined {
                merged.extend(found);
            }
        }

        let mut seen = HashSet::with_capacity(merged.len());
        merged.retain(|c| c.identity != self.id && seen.insert(c.identity));
        merged.sort_by(|a, b| distance_cmp(&a.distance_to(&target), &b.distance_to(&target)));
        merged.truncate(k);

        debug!(
            target = %hex::encode(&target.as_bytes()[..8]),
            found = merged.len(),
            visited = visited.lock().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "lookup completed"
        );
        merged
    }

    async fn run_frontier(
        &self,
        path: usize,
        target: Identity,
        mut frontier: LookupFrontier,
        visited: Arc<Mutex<HashSet<Identity>>>,
    ) -> Vec<Contact> {
        let LookupParams { k, alpha, query_timeout, .. } = self.params;
        let mut rounds = 0;

        while !frontier.queue.is_empty() && rounds < MAX_FRONTIER_ROUNDS {
            rounds += 1;
            frontier
                .queue
                .make_contiguous()
                .sort_by(|a, b| distance_cmp(&a.distance_to(&target), &b.distance_to(&target)));
            let take = frontier.queue.len().min(alpha);
            let batch: Vec<Contact> = frontier.queue.drain(..take).collect();

            let mut queries = JoinSet::new();
            for contact in batch {
                let network = self.network.clone();
                queries.spawn(async move {
                    let result = tokio::time::timeout(query_timeout, network.lookup_node(&contact, target)).await;
                    (contact, result)
                });
            }
            frontier.pending = queries.len();

            while let Some(joined) = queries.join_next().await {
                frontier.pending -= 1;
                let Ok((contact, result)) = joined else { continue };

                let mut peers = match result {
                    Ok(Ok(peers)) => {
                        self.routing.update(contact.clone());
                        peers
                    }
                    Ok(Err(e)) => {
                        debug!(path, peer = %contact.identity, error = %e, "lookup query failed");
                        continue;
                    }
                    Err(_) => {
                        debug!(path, peer = %contact.identity, "lookup query timed out");
                        continue;
                    }
                };
                peers.truncate(k);

                let bound = frontier.kth_distance(&target, k);
                let mut visited = visited.lock();
                for peer in peers {
                    if !visited.insert(peer.identity) {
                        continue;
                    }
                    let closer = bound
                        .is_none_or(|b| distance_cmp(&peer.distance_to(&target), &b).is_lt());
                    if closer {
                        frontier.queue.push_back(peer.clone());
                    }
                    frontier.found.push(peer);
                }
            }
            trace!(path, round = rounds, queued = frontier.queue.len(), found = frontier.found.len(), "frontier round");
        }

        frontier.found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use anyhow::anyhow;
    use ed25519_dalek::SigningKey;
    use tokio::sync::{Mutex as AsyncMutex, RwLock};
    use tokio::time::sleep;

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        self_contact: Contact,
        latencies: Arc<AsyncMutex<HashMap<Identity, Duration>>>,
        failures: Arc<AsyncMutex<HashSet<Identity>>>,
        queries: Arc<AsyncMutex<Vec<Identity>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, self_contact: Contact) -> Self {
            Self {
                registry,
                self_contact,
                latencies: Arc::new(AsyncMutex::new(HashMap::new())),
                failures: Arc::new(AsyncMutex::new(HashSet::new())),
                queries: Arc::new(AsyncMutex::new(Vec::new())),
            }
        }

        async fn set_latency(&self, node: Identity, latency: Duration) {
            self.latencies.lock().await.insert(node, latency);
        }

        async fn set_failure(&self, node: Identity, fail: bool) {
            let mut failures = self.failures.lock().await;
            if fail { failures.insert(node); } else { failures.remove(&node); }
        }

        async fn query_calls(&self) -> Vec<Identity> {
            self.queries.lock().await.clone()
        }
    }

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<Identity, DhtNode<TestNetwork>>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().await.insert(node.identity(), node.clone());
        }

        async fn get(&self, id: &Identity) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }
    }

    #[async_trait::async_trait]
    impl LookupRpc for TestNetwork {
        async fn lookup_node(&self, to: &Contact, target: Identity) -> anyhow::Result<Vec<Contact>> {
            self.queries.lock().await.push(to.identity);
            if self.failures.lock().await.contains(&to.identity) {
                return Err(anyhow!("injected network failure"));
            }
            let delay = self.latencies.lock().await.get(&to.identity).copied();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            match self.registry.get(&to.identity).await {
                Some(peer) => Ok(peer.handle_lookup_request(&self.self_contact.identity, target)),
                None => Err(anyhow!("peer not reachable")),
            }
        }
    }

    struct TestNode {
        node: DhtNode<TestNetwork>,
        network: TestNetwork,
    }

    impl TestNode {
        async fn new(registry: Arc<NetworkRegistry>, index: u32, params: LookupParams) -> Self {
            let contact = make_contact(index);
            let network = TestNetwork::new(registry.clone(), contact.clone());
            let routing = Arc::new(RoutingTable::new(contact.identity, params.k));
            let node = DhtNode::new(routing, network.clone(), params);
            registry.register(&node).await;
            Self { node, network }
        }

        fn contact(&self) -> Contact {
            make_contact_for(self.node.identity())
        }
    }

    fn params(k: usize) -> LookupParams {
        LookupParams {
            k,
            alpha: 3,
            disjoint_paths: 3,
            query_timeout: Duration::from_secs(3),
        }
    }

    fn make_identity(index: u32) -> Identity {
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&index.to_be_bytes());
        let signing_key = SigningKey::from_bytes(&seed);
        Identity::from_bytes(signing_key.verifying_key().to_bytes())
    }

    fn make_contact_for(identity: Identity) -> Contact {
        Contact::new(identity, format!("mem://{}", &identity.to_hex()[..12]))
    }

    fn make_contact(index: u32) -> Contact {
        make_contact_for(make_identity(index))
    }

    async fn full_mesh(count: u32, k: usize) -> Vec<TestNode> {
        let registry = Arc::new(NetworkRegistry::default());
        let mut nodes = Vec::with_capacity(count as usize);
        for i in 0..count {
            nodes.push(TestNode::new(registry.clone(), 0x100 + i, params(k)).await);
        }
        for i in 0..nodes.len() {
            for j in 0..nodes.len() {
                if i != j {
                    nodes[i].node.routing_table().update(nodes[j].contact());
                }
            }
        }
        nodes
    }

    fn assert_well_formed(results: &[Contact], target: &Identity, self_id: &Identity, k: usize) {
        assert!(results.len() <= k);
        let unique: HashSet<_> = results.iter().map(|c| c.identity).collect();
        assert_eq!(unique.len(), results.len(), "duplicate contacts in lookup result");
        assert!(!unique.contains(self_id));
        for pair in results.windows(2) {
            assert!(distance_cmp(&pair[0].distance_to(target), &pair[1].distance_to(target)).is_lt());
        }
    }

    #[tokio::test]
    async fn find_node_returns_target_first() {
        let nodes = full_mesh(10, 20).await;
        let target = nodes[5].node.identity();

        let results = nodes[0].node.find_node(target).await;

        assert_eq!(results.first().map(|c| c.identity), Some(target));
        assert_eq!(results.len(), 9);
        assert_well_formed(&results, &target, &nodes[0].node.identity(), 20);
    }

    #[tokio::test]
    async fn lookup_is_bounded_sorted_and_deduplicated() {
        let k = 8;
        let nodes = full_mesh(40, k).await;
        let self_id = nodes[0].node.identity();

        for index in 1000..1010u32 {
            let target = make_identity(index);
            let results = nodes[0].node.find_node(target).await;
            assert_eq!(results.len(), k);
            assert_well_formed(&results, &target, &self_id, k);

            let members: HashSet<Identity> = nodes.iter().map(|n| n.node.identity()).collect();
            assert!(results.iter().all(|c| members.contains(&c.identity)));
        }
    }

    #[tokio::test]
    async fn responder_refresh_keeps_known_address() {
        let registry = Arc::new(NetworkRegistry::default());
        let narrow = LookupParams { alpha: 1, disjoint_paths: 1, ..params(20) };
        let origin = TestNode::new(registry.clone(), 0x300, narrow).await;
        let liar = TestNode::new(registry.clone(), 0x301, narrow).await;
        let honest = TestNode::new(registry.clone(), 0x302, narrow).await;
        let honest_id = honest.node.identity();

        origin.node.routing_table().update(Contact::new(honest_id, "10.0.0.1:4000"));
        origin.node.routing_table().update(liar.contact());
        liar.node.routing_table().update(Contact::new(honest_id, "6.6.6.6:666"));

        origin.node.find_node(liar.node.identity()).await;

        assert!(origin.network.query_calls().await.contains(&honest_id));
        let stored = origin.node.routing_table().get(&honest_id).unwrap();
        assert_eq!(stored.addr, "10.0.0.1:4000");
    }

    #[tokio::test]
    async fn no_peer_is_queried_twice() {
        let nodes = full_mesh(30, 20).await;
        let target = make_identity(4242);

        nodes[0].node.find_node(target).await;

        let calls = nodes[0].network.query_calls().await;
        let unique: HashSet<_> = calls.iter().collect();
        assert_eq!(unique.len(), calls.len());
        assert!(!calls.contains(&nodes[0].node.identity()));
    }

    #[tokio::test]
    async fn empty_routing_table_yields_empty_result() {
        let registry = Arc::new(NetworkRegistry::default());
        let lonely = TestNode::new(registry, 0x01, params(20)).await;
        assert!(lonely.node.find_node(make_identity(7)).await.is_empty());
    }

    #[tokio::test]
    async fn failing_peers_degrade_gracefully() {
        let nodes = full_mesh(12, 20).await;
        let origin = &nodes[0];
        for node in &nodes[1..6] {
            origin.network.set_failure(node.node.identity(), true).await;
        }

        let target = nodes[9].node.identity();
        let results = origin.node.find_node(target).await;

        assert_well_formed(&results, &target, &origin.node.identity(), 20);
        assert!(results.iter().any(|c| c.identity == target));
    }

    #[tokio::test]
    async fn slow_peers_time_out_without_blocking() {
        let registry = Arc::new(NetworkRegistry::default());
        let fast_params = LookupParams { query_timeout: Duration::from_millis(50), ..params(20) };
        let origin = TestNode::new(registry.clone(), 0x01, fast_params).await;
        let slow = TestNode::new(registry.clone(), 0x02, fast_params).await;
        let quick = TestNode::new(registry.clone(), 0x03, fast_params).await;
        origin.node.routing_table().update(slow.contact());
        origin.node.routing_table().update(quick.contact());
        quick.node.routing_table().update(slow.contact());
        origin.network.set_latency(slow.node.identity(), Duration::from_secs(5)).await;

        let started = Instant::now();
        let results = origin.node.find_node(make_identity(99)).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn handle_lookup_request_excludes_requester() {
        let nodes = full_mesh(6, 20).await;
        let requester = nodes[1].node.identity();

        let response = nodes[0].node.handle_lookup_request(&requester, requester);

        assert_eq!(response.len(), 4);
        assert!(response.iter().all(|c| c.identity != requester));
    }

    #[tokio::test]
    async fn handle_lookup_request_is_truncated_to_k() {
        let nodes = full_mesh(12, 4).await;
        let response = nodes[0].node.handle_lookup_request(&nodes[1].node.identity(), make_identity(5));
        assert!(response.len() <= 4);
    }

    #[tokio::test]
    async fn bootstrap_from_single_seed_populates_routing() {
        let registry = Arc::new(NetworkRegistry::default());
        let seed = TestNode::new(registry.clone(), 0x01, params(20)).await;
        let mut others = Vec::new();
        for i in 0..5 {
            let node = TestNode::new(registry.clone(), 0x10 + i, params(20)).await;
            seed.node.routing_table().update(node.contact());
            others.push(node);
        }
        let newcomer = TestNode::new(registry.clone(), 0x99, params(20)).await;

        let results = newcomer.node.bootstrap(seed.contact()).await;

        assert!(results.iter().any(|c| c.identity == seed.node.identity()));
        assert_eq!(results.len(), 6);
        assert!(newcomer.node.routing_table().exists(&seed.node.identity()));
        for node in &others {
            assert!(newcomer.node.routing_table().exists(&node.node.identity()));
        }
    }
}
