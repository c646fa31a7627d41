//! # Node engine
//!
//! A [`Node`] is the public handle to one peer. The engine behind it is an
//! actor owning all mutable state — routing table, datastore and the
//! pending-request map — and processing commands sequentially, so no state
//! is ever touched from two tasks at once. Handles are cheap to clone and
//! talk to the actor over an async channel; replies travel back on oneshot
//! channels.
//!
//! ## Message flow
//!
//! Inbound frames are decoded and signature-verified on a pump task (CPU
//! work stays off the actor), then delivered as commands. The engine always
//! offers the sender's contact to the routing table before dispatching, then
//! either answers a request or correlates a response with the pending map —
//! the single source of truth for what is in flight. A reaper tick times out
//! stale pending entries and charges the contact's failure counter.
//!
//! ## Timers
//!
//! One maintenance tick drives the expiry scan, republication, cache-copy
//! pruning and bucket refresh; a faster reaper tick expires pending
//! requests. Long work (lookups, republication stores) runs on spawned
//! tasks driven through the public handle, never on the actor itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::identity::{Contact, Keypair, NodeId};
use crate::item::{ItemError, SignedItem};
use crate::lookup::{
    Lookup, LookupError, LookupKind, LookupOutcome, LookupRpc, PeerReply, QueryFailed,
};
use crate::messages::{
    version_compatible, Envelope, ErrorCode, Payload, PeerInfo, RequestId, WireError,
};
use crate::protocols::{Clock, InboundFrames, Transport};
use crate::routing::{InsertOutcome, RoutingTable};
use crate::store::Datastore;

/// Depth of the actor command queue.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Recently handled request ids kept for duplicate suppression.
const RECENT_REQUEST_WINDOW: usize = 4096;

/// Per-peer outcome of publishing an item to its K closest nodes.
#[derive(Debug, Clone)]
pub struct StoreReport {
    pub key: NodeId,
    /// Peers that acknowledged the store.
    pub accepted: Vec<NodeId>,
    /// Peers that answered with a store error, and their reason.
    pub rejected: Vec<(NodeId, String)>,
    /// Peers that never answered.
    pub unreachable: Vec<NodeId>,
}

impl StoreReport {
    fn new(key: NodeId) -> Self {
        Self {
            key,
            accepted: Vec::new(),
            rejected: Vec::new(),
            unreachable: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum JoinError {
    /// No seed contacts were supplied.
    NoSeeds,
    /// The initial self-lookup failed.
    Lookup(LookupError),
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::NoSeeds => write!(f, "no seed contacts to join through"),
            JoinError::Lookup(e) => write!(f, "join lookup failed: {}", e),
        }
    }
}

impl std::error::Error for JoinError {}

#[derive(Debug)]
pub enum PublishError {
    /// The item could not be built (invalid arguments).
    Item(ItemError),
    /// The placement lookup failed.
    Lookup(LookupError),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Item(e) => write!(f, "building item failed: {}", e),
            PublishError::Lookup(e) => write!(f, "placement lookup failed: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

/// Point-in-time engine counters, for embedders and the status loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeSnapshot {
    pub contacts: usize,
    pub buckets: usize,
    pub items: usize,
    pub pending_requests: usize,
}

/// Failure of a single request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcFailure {
    /// No response before the per-request timeout.
    Timeout,
    /// The transport refused the frame.
    Send,
    /// The peer answered with an out-of-band `Error`.
    Remote(u8),
    /// The engine has shut down.
    EngineStopped,
}

struct PendingRequest {
    peer: Contact,
    reply: oneshot::Sender<Result<Payload, RpcFailure>>,
    expires_at_ms: u64,
}

enum Command {
    Deliver {
        source: String,
        envelope: Envelope,
    },
    ProtocolFault {
        sender: NodeId,
    },
    SendRequest {
        to: Contact,
        payload: Payload,
        reply: oneshot::Sender<Result<Payload, RpcFailure>>,
    },
    AbortPending {
        uuid: RequestId,
        failure: RpcFailure,
    },
    ReapPending,
    ObserveContact(Contact),
    HeadProbeResult {
        head: NodeId,
        alive: bool,
    },
    ClosestContacts {
        target: NodeId,
        count: usize,
        reply: oneshot::Sender<Vec<Contact>>,
    },
    StoreLocal {
        item: SignedItem,
        reply: oneshot::Sender<Result<(), ItemError>>,
    },
    GetLocal {
        key: NodeId,
        reply: oneshot::Sender<Option<SignedItem>>,
    },
    JoinRefreshTargets {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    Maintain,
    Snapshot {
        reply: oneshot::Sender<NodeSnapshot>,
    },
    Shutdown,
}

/// Public handle to a running node.
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    keypair: Arc<Keypair>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    id: NodeId,
    address: String,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            keypair: Arc::clone(&self.keypair),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            id: self.id,
            address: self.address.clone(),
        }
    }
}

impl Node {
    /// Start a node engine on the given transport.
    ///
    /// `address` is the address peers reach us at (its port becomes the
    /// envelope `reply_port` when it parses as a socket address). `seeds`
    /// are offered to the routing table immediately; call [`Node::join`] to
    /// actually enter the network.
    pub fn spawn(
        keypair: Keypair,
        address: impl Into<String>,
        seeds: Vec<Contact>,
        config: Config,
        clock: Arc<dyn Clock>,
        transport: impl Transport,
        inbound: InboundFrames,
    ) -> Node {
        let address = address.into();
        let keypair = Arc::new(keypair);
        let config = Arc::new(config);
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let id = keypair.node_id();
        let reply_port = address
            .parse::<SocketAddr>()
            .map(|a| a.port())
            .unwrap_or(0);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let node = Node {
            cmd_tx,
            keypair: Arc::clone(&keypair),
            config: Arc::clone(&config),
            clock: Arc::clone(&clock),
            id,
            address,
        };

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let engine = Engine {
            handle: node.clone(),
            cmd_rx,
            routing: RoutingTable::new(id, config.k, config.max_failures, clock.now_ms()),
            store: Datastore::new(),
            pending: HashMap::new(),
            recent_requests: LruCache::new(
                NonZeroUsize::new(RECENT_REQUEST_WINDOW).expect("window is non-zero"),
            ),
            transport: Arc::clone(&transport),
            keypair: Arc::clone(&keypair),
            config: Arc::clone(&config),
            clock: Arc::clone(&clock),
            rng,
            reply_port,
        };
        tokio::spawn(engine.run());

        spawn_inbound_pump(node.clone(), transport, inbound, reply_port);
        spawn_tick(node.clone(), config.maintenance_interval_ms, || Command::Maintain);
        spawn_tick(node.clone(), config.reaper_interval_ms, || Command::ReapPending);

        for seed in seeds {
            let tx = node.cmd_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(Command::ObserveContact(seed)).await;
            });
        }

        info!(id = &id.to_hex()[..16], address = %node.address, "node engine started");
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The Ed25519 public key behind this node's identity.
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    /// Our own contact record, as peers would see it.
    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.address.clone(), self.config.version.clone())
    }

    /// Iteratively locate the K closest peers to `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Contact>, LookupError> {
        self.lookup_nodes(target).await
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot { reply: tx }).await.is_err() {
            return NodeSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Join the network: seed the routing table, look up our own id, then
    /// refresh every bucket farther away than our closest neighbor.
    pub async fn join(&self, seeds: &[Contact]) -> Result<(), JoinError> {
        if seeds.is_empty() {
            return Err(JoinError::NoSeeds);
        }
        for seed in seeds {
            let _ = self
                .cmd_tx
                .send(Command::ObserveContact(seed.clone()))
                .await;
        }

        self.lookup_nodes(self.id).await.map_err(JoinError::Lookup)?;

        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Command::JoinRefreshTargets { reply: tx })
            .await;
        let targets = rx.await.unwrap_or_default();

        let mut refreshes = JoinSet::new();
        for target in targets {
            let node = self.clone();
            refreshes.spawn(async move {
                let _ = node.lookup_nodes(target).await;
            });
        }
        while refreshes.join_next().await.is_some() {}

        debug!(id = &self.id.to_hex()[..16], "join complete");
        Ok(())
    }

    /// Build, sign and publish an item under this node's key for `name`.
    pub async fn set(
        &self,
        name: &str,
        value: Vec<u8>,
        expires: u64,
        meta: Vec<(String, String)>,
    ) -> Result<StoreReport, PublishError> {
        let item = SignedItem::build(
            &self.keypair,
            name,
            value,
            expires,
            meta,
            self.config.version.as_str(),
            self.clock.wall_ms(),
        )
        .map_err(PublishError::Item)?;

        let _ = self.store_local(item.clone()).await;
        self.publish_item(&item).await.map_err(PublishError::Lookup)
    }

    /// Fetch the item published by `publisher_public_key` under `name`.
    ///
    /// Checks the local datastore first, then runs a `FIND_VALUE` traversal.
    /// After a network hit the value is opportunistically pushed to the
    /// closest peer that answered without holding it.
    pub async fn get(
        &self,
        name: &str,
        publisher_public_key: &[u8; 32],
    ) -> Result<SignedItem, LookupError> {
        let key = crate::item::derive_key(publisher_public_key, name);

        if let Some(item) = self.get_local(key).await {
            let wall = self.clock.wall_ms();
            if item.expires == 0 || item.expires >= wall {
                return Ok(item);
            }
        }

        match self.lookup_value(key).await? {
            LookupOutcome::Value { item, cache_to } => {
                if let Some(peer) = cache_to {
                    let node = self.clone();
                    let cached = item.clone();
                    tokio::spawn(async move {
                        trace!(
                            peer = &peer.id.to_hex()[..8],
                            key = &cached.key.to_hex()[..8],
                            "caching value at closest non-holder"
                        );
                        let _ = node.request(&peer, Payload::Store(cached)).await;
                    });
                }
                Ok(item)
            }
            LookupOutcome::Nodes(_) => Err(LookupError::ValueNotFound),
        }
    }

    /// Stop timers and drain pending requests. The handle stays valid but
    /// every subsequent operation fails.
    pub async fn leave(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    // ------------------------------------------------------------------
    // Internal plumbing shared by lookups, timers and the public API.
    // ------------------------------------------------------------------

    pub(crate) async fn request(
        &self,
        to: &Contact,
        payload: Payload,
    ) -> Result<Payload, RpcFailure> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SendRequest {
                to: to.clone(),
                payload,
                reply: tx,
            })
            .await
            .is_err()
        {
            return Err(RpcFailure::EngineStopped);
        }
        rx.await.unwrap_or(Err(RpcFailure::EngineStopped))
    }

    pub(crate) async fn ping(&self, peer: &Contact) -> bool {
        let timeout = Duration::from_millis(self.config.ping_timeout_ms);
        matches!(
            tokio::time::timeout(timeout, self.request(peer, Payload::Ping)).await,
            Ok(Ok(Payload::Pong))
        )
    }

    async fn closest_contacts(&self, target: NodeId, count: usize) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ClosestContacts {
                target,
                count,
                reply: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn store_local(&self, item: SignedItem) -> Result<(), ItemError> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::StoreLocal { item, reply: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    async fn get_local(&self, key: NodeId) -> Option<SignedItem> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetLocal { key, reply: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    fn lookup(&self) -> Lookup<Node> {
        Lookup::new(
            self.clone(),
            Arc::clone(&self.clock),
            self.config.k,
            self.config.alpha,
            self.config.lookup_deadline_ms,
            self.config.max_clock_skew_ms,
        )
    }

    pub(crate) async fn lookup_nodes(&self, target: NodeId) -> Result<Vec<Contact>, LookupError> {
        let seeds = self.closest_contacts(target, self.config.k).await;
        match self.lookup().run(LookupKind::FindNode, target, seeds).await? {
            LookupOutcome::Nodes(contacts) => Ok(contacts),
            LookupOutcome::Value { .. } => Ok(Vec::new()),
        }
    }

    async fn lookup_value(&self, target: NodeId) -> Result<LookupOutcome, LookupError> {
        let seeds = self.closest_contacts(target, self.config.k).await;
        self.lookup().run(LookupKind::FindValue, target, seeds).await
    }

    /// Place an item on the K peers closest to its key.
    async fn publish_item(&self, item: &SignedItem) -> Result<StoreReport, LookupError> {
        let closest = self.lookup_nodes(item.key).await?;
        let mut report = StoreReport::new(item.key);

        let mut stores = JoinSet::new();
        for peer in closest {
            let node = self.clone();
            let item = item.clone();
            stores.spawn(async move {
                let outcome = node.request(&peer, Payload::Store(item)).await;
                (peer, outcome)
            });
        }
        while let Some(joined) = stores.join_next().await {
            let Ok((peer, outcome)) = joined else { continue };
            match outcome {
                Ok(Payload::StoreOk) => report.accepted.push(peer.id),
                Ok(Payload::StoreErr { reason }) => report.rejected.push((peer.id, reason)),
                Ok(_) => report
                    .rejected
                    .push((peer.id, "unexpected reply".to_string())),
                Err(_) => report.unreachable.push(peer.id),
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl LookupRpc for Node {
    async fn query(
        &self,
        peer: &Contact,
        kind: LookupKind,
        target: NodeId,
    ) -> Result<PeerReply, QueryFailed> {
        let payload = match kind {
            LookupKind::FindNode => Payload::FindNode { target },
            LookupKind::FindValue => Payload::FindValue { target },
        };
        match self.request(peer, payload).await {
            Ok(Payload::Nodes(infos)) => {
                let contacts = infos
                    .into_iter()
                    .filter(|info| info.id != self.id)
                    .map(PeerInfo::into_contact)
                    .collect();
                Ok(PeerReply::Nodes(contacts))
            }
            Ok(Payload::Value(item)) if kind == LookupKind::FindValue => {
                Ok(PeerReply::Value(item))
            }
            Ok(other) => {
                debug!(
                    peer = &peer.id.to_hex()[..8],
                    kind = other.kind(),
                    "unexpected lookup reply"
                );
                Err(QueryFailed)
            }
            Err(_) => Err(QueryFailed),
        }
    }
}

/// Reply address for a frame: the source IP with the advertised reply port,
/// or the source as-is for transports without socket addresses.
fn reply_address(source: &str, reply_port: u16) -> String {
    if reply_port == 0 {
        return source.to_string();
    }
    match source.parse::<SocketAddr>() {
        Ok(addr) => SocketAddr::new(addr.ip(), reply_port).to_string(),
        Err(_) => source.to_string(),
    }
}

fn spawn_tick(node: Node, period_ms: u64, make: fn() -> Command) {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_millis(period_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            if node.cmd_tx.send(make()).await.is_err() {
                break;
            }
        }
    });
}

/// Decode and verify inbound frames off the actor task, replying with
/// out-of-band errors where the protocol calls for them.
fn spawn_inbound_pump(
    node: Node,
    transport: Arc<dyn Transport>,
    mut inbound: InboundFrames,
    reply_port: u16,
) {
    tokio::spawn(async move {
        while let Some((source, frame)) = inbound.recv().await {
            let envelope = match Envelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    trace!(%source, error = %e, "dropping undecodable frame");
                    send_error_reply(
                        &node,
                        &transport,
                        source,
                        ErrorCode::Malformed,
                        "frame did not decode",
                        [0u8; 16],
                        reply_port,
                    );
                    continue;
                }
            };

            let is_request = envelope.payload.is_request();
            let peer_addr = reply_address(&source, envelope.reply_port);

            if !version_compatible(&node.config.version, &envelope.version) {
                debug!(
                    %source,
                    theirs = %envelope.version,
                    ours = %node.config.version,
                    "incompatible protocol version"
                );
                if is_request {
                    send_error_reply(
                        &node,
                        &transport,
                        peer_addr,
                        ErrorCode::Version,
                        "incompatible protocol version",
                        envelope.uuid,
                        reply_port,
                    );
                }
                let _ = node
                    .cmd_tx
                    .send(Command::ProtocolFault {
                        sender: envelope.sender,
                    })
                    .await;
                continue;
            }

            if let Err(e) = envelope.verify() {
                debug!(%source, error = %e, "rejecting unverifiable envelope");
                if is_request {
                    let code = match e {
                        WireError::SenderBinding | WireError::Signature(_) => {
                            ErrorCode::Signature
                        }
                        WireError::Decode(_) => ErrorCode::Malformed,
                    };
                    send_error_reply(
                        &node,
                        &transport,
                        peer_addr,
                        code,
                        "envelope failed verification",
                        envelope.uuid,
                        reply_port,
                    );
                }
                let _ = node
                    .cmd_tx
                    .send(Command::ProtocolFault {
                        sender: envelope.sender,
                    })
                    .await;
                continue;
            }

            if node
                .cmd_tx
                .send(Command::Deliver { source, envelope })
                .await
                .is_err()
            {
                break;
            }
        }
    });
}

fn send_error_reply(
    node: &Node,
    transport: &Arc<dyn Transport>,
    to: String,
    code: ErrorCode,
    detail: &str,
    original_uuid: RequestId,
    reply_port: u16,
) {
    let keypair = Arc::clone(&node.keypair);
    let version = node.config.version.clone();
    let transport = Arc::clone(transport);
    let detail = detail.to_string();
    let mut uuid = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut uuid);
    tokio::spawn(async move {
        let payload = Payload::Error {
            code: code.code(),
            detail,
            original_uuid,
        };
        match Envelope::seal(&keypair, uuid, &version, reply_port, payload)
            .and_then(|envelope| envelope.encode())
        {
            Ok(frame) => {
                if let Err(e) = transport.send(&to, frame).await {
                    trace!(%to, error = %e, "error reply not delivered");
                }
            }
            Err(e) => warn!(error = %e, "failed to seal error reply"),
        }
    });
}

struct Engine {
    handle: Node,
    cmd_rx: mpsc::Receiver<Command>,
    routing: RoutingTable,
    store: Datastore,
    pending: HashMap<RequestId, PendingRequest>,
    recent_requests: LruCache<RequestId, ()>,
    transport: Arc<dyn Transport>,
    keypair: Arc<Keypair>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    reply_port: u16,
}

impl Engine {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Deliver { source, envelope } => {
                    self.handle_deliver(source, envelope);
                }
                Command::ProtocolFault { sender } => {
                    self.routing.record_failure(&sender);
                }
                Command::SendRequest { to, payload, reply } => {
                    self.handle_send_request(to, payload, reply);
                }
                Command::AbortPending { uuid, failure } => {
                    if let Some(pending) = self.pending.remove(&uuid) {
                        self.routing.record_failure(&pending.peer.id);
                        let _ = pending.reply.send(Err(failure));
                    }
                }
                Command::ReapPending => {
                    self.reap_pending();
                }
                Command::ObserveContact(contact) => {
                    self.observe(contact);
                }
                Command::HeadProbeResult { head, alive } => {
                    self.routing
                        .apply_head_probe(&head, alive, self.clock.now_ms());
                }
                Command::ClosestContacts {
                    target,
                    count,
                    reply,
                } => {
                    if target != self.routing.self_id() {
                        self.routing.touch_bucket(&target, self.clock.now_ms());
                    }
                    let _ = reply.send(self.routing.k_closest(&target, count, None));
                }
                Command::StoreLocal { item, reply } => {
                    let result = self.verify_and_store(item);
                    let _ = reply.send(result);
                }
                Command::GetLocal { key, reply } => {
                    let _ = reply.send(self.local_value(&key));
                }
                Command::JoinRefreshTargets { reply } => {
                    let _ = reply.send(self.routing.join_refresh_targets(&mut self.rng));
                }
                Command::Maintain => {
                    self.maintain();
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(NodeSnapshot {
                        contacts: self.routing.contact_count(),
                        buckets: self.routing.bucket_count(),
                        items: self.store.len(),
                        pending_requests: self.pending.len(),
                    });
                }
                Command::Shutdown => {
                    break;
                }
            }
        }

        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(RpcFailure::EngineStopped));
        }
        info!(id = &self.handle.id.to_hex()[..16], "node engine stopped");
    }

    /// A verified envelope: offer the sender to the routing table, then
    /// answer a request or complete the matching pending entry.
    fn handle_deliver(&mut self, source: String, envelope: Envelope) {
        let now = self.clock.now_ms();
        let peer_addr = reply_address(&source, envelope.reply_port);
        let sender = Contact::new(envelope.sender, peer_addr.clone(), envelope.version.clone());
        self.observe(sender);

        if envelope.payload.is_request() {
            if self.recent_requests.put(envelope.uuid, ()).is_some() {
                trace!(
                    peer = &envelope.sender.to_hex()[..8],
                    "suppressing duplicate request"
                );
                return;
            }
            let response = self.dispatch_request(&envelope, now);
            self.send_payload(peer_addr, envelope.uuid, response);
            return;
        }

        let correlation = match &envelope.payload {
            Payload::Error { original_uuid, .. } => *original_uuid,
            _ => envelope.uuid,
        };
        let matches = self
            .pending
            .get(&correlation)
            .map(|p| p.peer.id == envelope.sender)
            .unwrap_or(false);
        if !matches {
            // Unknown, abandoned or forged correlation id: the contact
            // observation above is all this frame gets to do.
            trace!(
                peer = &envelope.sender.to_hex()[..8],
                kind = envelope.payload.kind(),
                "response without a pending request"
            );
            return;
        }
        let pending = self
            .pending
            .remove(&correlation)
            .expect("pending entry checked above");
        self.routing.record_success(&envelope.sender, now);
        let sender = envelope.sender;
        let result = match envelope.payload {
            Payload::Error { code, detail, .. } => {
                debug!(
                    peer = &sender.to_hex()[..8],
                    code,
                    detail = detail.as_str(),
                    "peer reported an error"
                );
                Err(RpcFailure::Remote(code))
            }
            payload => Ok(payload),
        };
        let _ = pending.reply.send(result);
    }

    fn dispatch_request(&mut self, envelope: &Envelope, now: u64) -> Payload {
        // Serving a lookup for a target counts as activity for its bucket.
        if let Payload::FindNode { target } | Payload::FindValue { target } = &envelope.payload {
            if *target != self.routing.self_id() {
                self.routing.touch_bucket(target, now);
            }
        }

        match &envelope.payload {
            Payload::Ping => Payload::Pong,
            Payload::FindNode { target } => {
                let closest =
                    self.routing
                        .k_closest(target, self.config.k, Some(&envelope.sender));
                Payload::Nodes(closest.iter().map(PeerInfo::from_contact).collect())
            }
            Payload::FindValue { target } => match self.local_value(target) {
                Some(item) => Payload::Value(item),
                None => {
                    let closest =
                        self.routing
                            .k_closest(target, self.config.k, Some(&envelope.sender));
                    Payload::Nodes(closest.iter().map(PeerInfo::from_contact).collect())
                }
            },
            Payload::Store(item) => match self.verify_and_store(item.clone()) {
                Ok(()) => Payload::StoreOk,
                Err(e) => {
                    debug!(
                        peer = &envelope.sender.to_hex()[..8],
                        reason = %e,
                        "rejecting stored item"
                    );
                    Payload::StoreErr {
                        reason: e.to_string(),
                    }
                }
            },
            // `is_request` guarantees we never get here.
            _ => Payload::Error {
                code: ErrorCode::Unsupported.code(),
                detail: "unsupported request".to_string(),
                original_uuid: envelope.uuid,
            },
        }
    }

    /// Fetch from the datastore, discarding items that expired between
    /// maintenance scans.
    fn local_value(&mut self, key: &NodeId) -> Option<SignedItem> {
        let item = self.store.get(key, self.clock.now_ms())?;
        if item.expires != 0 && item.expires < self.clock.wall_ms() {
            self.store.remove(key);
            return None;
        }
        Some(item)
    }

    fn verify_and_store(&mut self, item: SignedItem) -> Result<(), ItemError> {
        item.verify(self.clock.wall_ms(), self.config.max_clock_skew_ms)?;
        self.store.insert(item, self.clock.now_ms());
        Ok(())
    }

    fn handle_send_request(
        &mut self,
        to: Contact,
        payload: Payload,
        reply: oneshot::Sender<Result<Payload, RpcFailure>>,
    ) {
        let mut uuid: RequestId = [0u8; 16];
        self.rng.fill_bytes(&mut uuid);

        let frame = match Envelope::seal(
            &self.keypair,
            uuid,
            &self.config.version,
            self.reply_port,
            payload,
        )
        .and_then(|envelope| envelope.encode())
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to seal request");
                let _ = reply.send(Err(RpcFailure::Send));
                return;
            }
        };

        self.pending.insert(
            uuid,
            PendingRequest {
                peer: to.clone(),
                reply,
                expires_at_ms: self.clock.now_ms() + self.config.request_timeout_ms,
            },
        );

        let transport = Arc::clone(&self.transport);
        let cmd_tx = self.handle.cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send(&to.address, frame).await {
                trace!(peer = %to.address, error = %e, "request frame not sent");
                let _ = cmd_tx
                    .send(Command::AbortPending {
                        uuid,
                        failure: RpcFailure::Send,
                    })
                    .await;
            }
        });
    }

    fn reap_pending(&mut self) {
        let now = self.clock.now_ms();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.expires_at_ms <= now)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in expired {
            if let Some(pending) = self.pending.remove(&uuid) {
                trace!(
                    peer = &pending.peer.id.to_hex()[..8],
                    "request timed out"
                );
                self.routing.record_failure(&pending.peer.id);
                let _ = pending.reply.send(Err(RpcFailure::Timeout));
            }
        }
    }

    fn observe(&mut self, contact: Contact) {
        let now = self.clock.now_ms();
        if let InsertOutcome::Cached { probe_head } = self.routing.insert(contact, now) {
            let node = self.handle.clone();
            tokio::spawn(async move {
                let alive = node.ping(&probe_head).await;
                let _ = node
                    .cmd_tx
                    .send(Command::HeadProbeResult {
                        head: probe_head.id,
                        alive,
                    })
                    .await;
            });
        }
    }

    /// One maintenance pass: expiry, cache pruning, republication, bucket
    /// refresh. The network traffic runs on a spawned task via the handle.
    fn maintain(&mut self) {
        let now = self.clock.now_ms();
        let wall = self.clock.wall_ms();

        self.store.expire_scan(wall);

        for key in self
            .store
            .stale_request_keys(now, self.config.republish_interval_ms)
        {
            if !self.routing.is_among_k_closest(&key) {
                debug!(key = &key.to_hex()[..8], "dropping stale caching copy");
                self.store.remove(&key);
            }
        }

        let due = self
            .store
            .republish_due(now, self.config.republish_interval_ms);
        for item in &due {
            self.store.mark_republished(&item.key, now);
        }

        let refresh = self
            .routing
            .refresh_targets(now, self.config.refresh_interval_ms, &mut self.rng);

        if due.is_empty() && refresh.is_empty() {
            return;
        }
        debug!(
            republish = due.len(),
            refresh = refresh.len(),
            "maintenance pass"
        );

        let node = self.handle.clone();
        tokio::spawn(async move {
            for item in due {
                if let Err(e) = node.publish_item(&item).await {
                    debug!(key = &item.key.to_hex()[..8], error = %e, "republication failed");
                }
            }
            for target in refresh {
                let _ = node.lookup_nodes(target).await;
            }
        });
    }

    fn send_payload(&self, to: String, uuid: RequestId, payload: Payload) {
        let keypair = Arc::clone(&self.keypair);
        let version = self.config.version.clone();
        let reply_port = self.reply_port;
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            match Envelope::seal(&keypair, uuid, &version, reply_port, payload)
                .and_then(|envelope| envelope.encode())
            {
                Ok(frame) => {
                    if let Err(e) = transport.send(&to, frame).await {
                        trace!(%to, error = %e, "reply not delivered");
                    }
                }
                Err(e) => warn!(error = %e, "failed to seal reply"),
            }
        });
    }
}
