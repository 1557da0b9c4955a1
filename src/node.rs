//! # High-Level Node API
//!
//! A [`Node`] owns everything one overlay participant needs: its keypair,
//! routing table, lookup engine, session pipeline and the map of live
//! connections. There are no global registries; every component is reached
//! through the node that owns it.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("127.0.0.1:0").await?;
//!
//! // Join through a known peer, then look for ourselves to fill the table.
//! node.bootstrap("192.0.2.10:4000").await?;
//!
//! node.broadcast(b"hello".to_vec()).await?;
//! let mut rx = node.messages().await?;
//! while let Some(msg) = rx.recv().await {
//!     println!("{}: {:?}", msg.from, msg.payload);
//! }
//! ```
//!
//! ## Connection lifecycle
//!
//! Every accepted or dialed stream becomes a [`Link`] and runs the secure
//! pipeline. Once the peer is authenticated and admitted the node registers
//! its lookup and broadcast handlers on the link, records the connection and
//! marks the peer seen in the routing table. When the link closes, for any
//! reason, the peer is dropped from both.
//!
//! A peer has at most one link. When both sides dial at once, each keeps the
//! link dialed by the lower identity. A newer link in the same direction
//! replaces the older one. A negotiation that is abandoned midway closes its
//! socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dht::DhtNode;
use crate::identity::{AcceptAll, AdmissionPolicy, Contact, Identity, IdentityProof, Keypair, PowAdmission};
use crate::messages::{Broadcast, Message, OP_BROADCAST};
use crate::protocols::LookupRpc;
use crate::routing::RoutingTable;
use crate::rpc::{self, SeenBroadcasts};
use crate::session::Pipeline;
use crate::transport::{DisconnectReason, Link, Role};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// Broadcasts buffered for the application before new ones are dropped.
const INBOX_CAPACITY: usize = 1024;

/// Broadcast ids remembered for deduplication.
const SEEN_BROADCASTS: usize = 4096;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Point-in-time view of a node, logged periodically by the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTelemetry {
    pub routing_peers: usize,
    pub connections: usize,
    /// `(bucket index, occupancy)` for non-empty buckets.
    pub buckets: Vec<(usize, usize)>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    keypair: Arc<Keypair>,
    contact: Contact,
    config: Config,
    local_addr: SocketAddr,
    routing: Arc<RoutingTable>,
    dht: DhtNode<LinkNetwork>,
    pipeline: Pipeline,
    admission: Box<dyn AdmissionPolicy>,
    connections: RwLock<HashMap<Identity, Link>>,
    next_request_id: AtomicU64,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: TakeOnce<Message>,
    seen_broadcasts: SeenBroadcasts,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Lookup transport over the node's own links, dialing on demand.
///
/// Holds the node weakly: the node owns the lookup engine, which owns this.
struct LinkNetwork {
    node: Weak<NodeInner>,
}

#[async_trait]
impl LookupRpc for LinkNetwork {
    async fn lookup_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>> {
        let node = self.node.upgrade().context("node is shut down")?;
        let link = node.link_to(to).await?;
        let request_id = node.next_request_id.fetch_add(1, Ordering::Relaxed);
        rpc::request_lookup(&link, request_id, target, node.config.bucket_size).await
    }
}

impl Node {
    /// Create a node with a fresh identity and default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, Config::default()).await
    }

    /// Create a node with a fresh identity, computing a proof-of-work when
    /// `config.pow_difficulty` asks for one.
    pub async fn bind_with_config(addr: &str, config: Config) -> Result<Self> {
        let (keypair, proof) = Keypair::generate_with_pow_difficulty(config.pow_difficulty)
            .map_err(|e| anyhow!("{e}"))?;
        Self::bind_with(addr, keypair, proof, config).await
    }

    /// Create a node with an existing keypair and its proof-of-work.
    pub async fn bind_with(addr: &str, keypair: Keypair, proof: IdentityProof, config: Config) -> Result<Self> {
        config.validate()?;
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let keypair = Arc::new(keypair);
        let identity = keypair.identity();
        let contact = Contact::new(identity, local_addr.to_string());
        let routing = Arc::new(RoutingTable::new(identity, config.bucket_size));
        let pipeline = Pipeline::secure(&config, keypair.clone(), contact.clone(), proof);
        let admission: Box<dyn AdmissionPolicy> = if config.pow_difficulty > 0 {
            Box::new(PowAdmission { difficulty: config.pow_difficulty })
        } else {
            Box::new(AcceptAll)
        };
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let seen = NonZeroUsize::new(SEEN_BROADCASTS).unwrap_or(NonZeroUsize::MIN);

        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| NodeInner {
            dht: DhtNode::new(routing.clone(), LinkNetwork { node: weak.clone() }, (&config).into()),
            keypair,
            contact,
            config,
            local_addr,
            routing,
            pipeline,
            admission,
            connections: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(Some(inbox_rx)),
            seen_broadcasts: Arc::new(Mutex::new(LruCache::new(seen))),
            listener: Mutex::new(None),
        });

        let handle = tokio::spawn(accept_loop(listener, Arc::downgrade(&inner)));
        *inner.listener.lock() = Some(handle);

        info!(identity = %identity, addr = %local_addr, "node listening");
        Ok(Self { inner })
    }

    pub fn identity(&self) -> Identity {
        self.inner.contact.identity
    }

    /// The contact other peers learn for this node.
    pub fn contact(&self) -> Contact {
        self.inner.contact.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.routing
    }

    /// Dial `addr`, run the secure pipeline and return the authenticated peer.
    pub async fn connect(&self, addr: &str) -> Result<Contact> {
        let (contact, _) = self.inner.connect(addr).await?;
        Ok(contact)
    }

    /// Iterative lookup for the contacts closest to `target`.
    pub async fn find_node(&self, target: Identity) -> Vec<Contact> {
        self.inner.dht.find_node(target).await
    }

    /// Connect to a known peer at `addr` and look up our own identity through it.
    pub async fn bootstrap(&self, addr: &str) -> Result<Vec<Contact>> {
        let seed = self.connect(addr).await?;
        let found = self.inner.dht.bootstrap(seed).await;
        info!(found = found.len(), routing_peers = self.inner.routing.len(), "bootstrap complete");
        Ok(found)
    }

    /// Send `payload` once to every connected peer. Returns how many peers
    /// the broadcast was queued for.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<usize> {
        let message = Broadcast { message_id: rand::random(), payload };
        self.inner.seen_broadcasts.lock().put(message.message_id, ());

        let links: Vec<(Identity, Link)> = self
            .inner
            .connections
            .read()
            .iter()
            .map(|(id, link)| (*id, link.clone()))
            .collect();

        let mut sent = 0;
        for (peer, link) in links {
            match link.send(OP_BROADCAST, &message).await {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer, error = %e, "broadcast send failed"),
            }
        }
        Ok(sent)
    }

    /// Take the receiver for broadcasts delivered to this node.
    pub async fn messages(&self) -> Result<mpsc::Receiver<Message>> {
        let mut guard = self.inner.inbox_rx.lock().await;
        guard.take().context("message receiver already taken")
    }

    /// Identities of the peers with a live connection.
    pub fn connected_peers(&self) -> Vec<Identity> {
        self.inner.connections.read().keys().copied().collect()
    }

    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.inner
            .connections
            .read()
            .get(identity)
            .is_some_and(|link| !link.is_closed())
    }

    /// Close the connection to `identity`. The peer leaves the routing table
    /// once its link has shut down.
    pub fn disconnect(&self, identity: &Identity) -> bool {
        let link = self.inner.connections.read().get(identity).cloned();
        match link {
            Some(link) => link.disconnect(DisconnectReason::LocalRequest),
            None => false,
        }
    }

    pub fn telemetry(&self) -> NodeTelemetry {
        NodeTelemetry {
            routing_peers: self.inner.routing.len(),
            connections: self.inner.connections.read().len(),
            buckets: self.inner.routing.bucket_sizes(),
        }
    }

    /// Stop accepting connections and close every live link.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
        let links: Vec<Link> = self.inner.connections.read().values().cloned().collect();
        for link in &links {
            link.disconnect(DisconnectReason::LocalRequest);
        }
        info!(closed = links.len(), "node shut down");
    }
}

impl NodeInner {
    async fn connect(self: &Arc<Self>, addr: &str) -> Result<(Contact, Link)> {
        let stream = tokio::time::timeout(self.config.handshake_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        let _ = stream.set_nodelay(true);
        self.establish(stream, Role::Dialer, addr.to_string()).await
    }

    /// Reuse the live link to `contact` or dial its advertised address.
    async fn link_to(self: &Arc<Self>, contact: &Contact) -> Result<Link> {
        if contact.identity == self.contact.identity {
            bail!("refusing to dial self");
        }
        let existing = self
            .connections
            .read()
            .get(&contact.identity)
            .filter(|link| !link.is_closed())
            .cloned();
        if let Some(link) = existing {
            return Ok(link);
        }

        let (established, link) = self.connect(&contact.addr).await?;
        if established.identity != contact.identity {
            link.disconnect(DisconnectReason::LocalRequest);
            bail!("{} answered as {}, expected {}", contact.addr, established.identity, contact.identity);
        }
        Ok(link)
    }

    async fn establish<S>(self: &Arc<Self>, stream: S, role: Role, remote: String) -> Result<(Contact, Link)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let link = Link::spawn(stream, role, remote, &self.config);
        let mut pending = PendingLink::new(&link);
        let session = self.pipeline.run(&link).await?;

        let contact = session
            .remote()
            .cloned()
            .context("pipeline finished without authenticating the peer")?;
        let proof = session.remote_proof().copied().unwrap_or_default();
        if !self.admission.admit(&contact, &proof) {
            link.disconnect(DisconnectReason::Rejected);
            warn!(peer = %contact.identity, addr = %contact.addr, "peer rejected by admission policy");
            bail!("peer {} rejected by admission policy", contact.identity);
        }

        let kept = self.adopt_link(&contact, &link);
        pending.settle();
        let outcome = self.routing.update_authenticated(contact.clone());
        info!(
            peer = %contact.identity,
            addr = %contact.addr,
            role = ?role,
            suite = ?session.cipher_suite(),
            outcome = ?outcome,
            "peer established"
        );
        Ok((contact, kept))
    }

    /// Identity of the side that dialed `link` to `peer`.
    fn dialed_by(&self, link: &Link, peer: &Identity) -> Identity {
        match link.role() {
            Role::Dialer => self.contact.identity,
            Role::Listener => *peer,
        }
    }

    /// Record `link` as the connection to the peer and return the link kept
    /// for it. Of two live links in opposite directions, both sides keep the
    /// one dialed by the lower identity; the other is closed.
    fn adopt_link(self: &Arc<Self>, contact: &Contact, link: &Link) -> Link {
        let identity = contact.identity;
        let adopted = {
            let mut connections = self.connections.write();
            let preferred = connections
                .get(&identity)
                .filter(|current| {
                    !current.is_closed()
                        && !current.same_link(link)
                        && current.role() != link.role()
                        && self.dialed_by(current, &identity) < self.dialed_by(link, &identity)
                })
                .cloned();
            match preferred {
                Some(current) => Err(current),
                None => Ok(connections.insert(identity, link.clone())),
            }
        };
        let replaced = match adopted {
            Ok(replaced) => replaced,
            Err(current) => {
                link.disconnect(DisconnectReason::Superseded);
                debug!(peer = %identity, role = ?link.role(), "duplicate link closed");
                return current;
            }
        };
        if let Some(old) = replaced
            && !old.same_link(link)
            && old.disconnect(DisconnectReason::Superseded)
        {
            debug!(peer = %identity, role = ?old.role(), "older link superseded");
        }

        rpc::serve_lookups(link, identity, self.dht.clone());
        rpc::serve_broadcasts(link, identity, self.inbox_tx.clone(), self.seen_broadcasts.clone());

        let node = Arc::downgrade(self);
        let watched = link.clone();
        tokio::spawn(async move {
            let reason = watched.closed().await;
            if let Some(node) = node.upgrade() {
                node.forget_link(&identity, &watched, &reason);
            }
        });
        link.clone()
    }

    /// Drop `link` from the connection map if it is still the current link
    /// for `identity`, and the peer from the routing table with it.
    fn forget_link(&self, identity: &Identity, link: &Link, reason: &DisconnectReason) {
        let removed = {
            let mut connections = self.connections.write();
            let current = connections.get(identity).is_some_and(|current| current.same_link(link));
            if current {
                connections.remove(identity);
                self.routing.remove(identity);
            }
            current
        };
        if removed {
            info!(peer = %identity, reason = %reason, "peer disconnected");
        }
    }
}

/// Closes a link whose negotiation never finished, including when the
/// future driving it is dropped by a caller's timeout.
struct PendingLink {
    link: Option<Link>,
}

impl PendingLink {
    fn new(link: &Link) -> Self {
        Self { link: Some(link.clone()) }
    }

    fn settle(&mut self) {
        self.link = None;
    }
}

impl Drop for PendingLink {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.disconnect(DisconnectReason::LocalRequest);
        }
    }
}

async fn accept_loop(listener: TcpListener, node: Weak<NodeInner>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let Some(node) = node.upgrade() else { break };
        let _ = stream.set_nodelay(true);

        tokio::spawn(async move {
            if let Err(e) = node.establish(stream, Role::Listener, remote.to_string()).await {
                debug!(remote = %remote, error = %format!("{e:#}"), "inbound connection failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn bind_reports_resolved_address() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
        assert_eq!(node.contact().addr, node.local_addr().to_string());
        assert_eq!(node.contact().identity, node.identity());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = Config::default().with_lookup(0, 3, 3);
        assert!(Node::bind_with_config("127.0.0.1:0", config).await.is_err());
    }

    #[tokio::test]
    async fn messages_can_be_taken_once() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        assert!(node.messages().await.is_ok());
        assert!(node.messages().await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn connect_registers_both_sides() {
        let a = Node::bind("127.0.0.1:0").await.unwrap();
        let b = Node::bind("127.0.0.1:0").await.unwrap();

        let contact = tokio::time::timeout(WAIT, a.connect(&b.local_addr().to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.identity, b.identity());
        assert!(a.routing_table().exists(&b.identity()));
        assert!(a.is_connected(&b.identity()));

        tokio::time::timeout(WAIT, async {
            while !b.routing_table().exists(&a.identity()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn link_to_self_is_refused() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        assert!(node.inner.link_to(&node.contact()).await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_without_peers_reaches_nobody() {
        let node = Node::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(node.broadcast(b"alone".to_vec()).await.unwrap(), 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn abandoned_dial_closes_socket() {
        // Accepts but never speaks, so the dial stalls in the key exchange.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config { lookup_timeout: Duration::from_millis(200), ..Config::default() };
        let node = Node::bind_with_config("127.0.0.1:0", config).await.unwrap();
        let stranger = Keypair::generate().identity();
        node.routing_table()
            .update(Contact::new(stranger, silent.local_addr().unwrap().to_string()));

        let _ = node.find_node(stranger).await;
        let (mut stream, _) = tokio::time::timeout(WAIT, silent.accept()).await.unwrap().unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(3), async {
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "abandoned dial left the socket open");
        assert!(!node.is_connected(&stranger));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn simultaneous_dials_keep_the_link_from_the_lower_identity() {
        let a = Node::bind("127.0.0.1:0").await.unwrap();
        let b = Node::bind("127.0.0.1:0").await.unwrap();
        let lower = a.identity().min(b.identity());

        let (a_addr, b_addr) = (a.local_addr().to_string(), b.local_addr().to_string());
        let _ = tokio::time::timeout(WAIT, async { tokio::join!(a.connect(&b_addr), b.connect(&a_addr)) }).await;

        // Dialer of the live link each node keeps for its peer.
        let kept_dialer = |node: &Node, peer: Identity| {
            let link = node.inner.connections.read().get(&peer).cloned()?;
            (!link.is_closed()).then(|| node.inner.dialed_by(&link, &peer))
        };
        tokio::time::timeout(WAIT, async {
            while kept_dialer(&a, b.identity()) != Some(lower) || kept_dialer(&b, a.identity()) != Some(lower) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(a.connected_peers(), vec![b.identity()]);
        assert_eq!(b.connected_peers(), vec![a.identity()]);

        let mut inbox = b.messages().await.unwrap();
        assert_eq!(a.broadcast(b"once".to_vec()).await.unwrap(), 1);
        let msg = tokio::time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"once");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn redial_supersedes_older_link() {
        let a = Node::bind("127.0.0.1:0").await.unwrap();
        let b = Node::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().to_string();

        let (_, first) = tokio::time::timeout(WAIT, a.inner.connect(&b_addr)).await.unwrap().unwrap();
        let (_, second) = tokio::time::timeout(WAIT, a.inner.connect(&b_addr)).await.unwrap().unwrap();

        assert!(!first.same_link(&second));
        // Either side may close the older link first.
        let reason = tokio::time::timeout(WAIT, first.closed()).await.unwrap();
        assert!(matches!(reason, DisconnectReason::Superseded | DisconnectReason::TransportClosed));
        assert!(!second.is_closed());
        assert!(a.is_connected(&b.identity()));
        assert!(a.routing_table().exists(&b.identity()));

        a.shutdown().await;
        b.shutdown().await;
    }
}
