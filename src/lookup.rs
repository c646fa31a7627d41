//! # Iterative lookup
//!
//! The traversal at the heart of every DHT operation: walk the keyspace
//! toward a target by querying, in parallel waves of α, the closest known
//! peers, folding every `NODES` reply back into a distance-sorted shortlist.
//!
//! The convergence rule follows the original recursive procedure: new
//! requests launch only when the nearest observed id improves, when a peer
//! fails, or — once nothing is in flight — to force contact of close
//! candidates that were skipped while progress had stalled. The lookup
//! finishes when the K nearest observed ids have all been queried (or a
//! verified value arrives).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::identity::{distance_cmp, Contact, NodeId};
use crate::item::SignedItem;
use crate::protocols::Clock;

/// How a lookup can fail. Surfaced to the embedder; the engine does not
/// retry a whole lookup on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// The routing table produced no seed contacts.
    NoPeers,
    /// The per-lookup deadline elapsed.
    Timeout,
    /// A `FIND_VALUE` traversal converged without finding the value.
    ValueNotFound,
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NoPeers => write!(f, "no known peers to start the lookup from"),
            LookupError::Timeout => write!(f, "lookup deadline elapsed"),
            LookupError::ValueNotFound => write!(f, "value not found"),
        }
    }
}

impl std::error::Error for LookupError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    FindValue,
}

/// Reply from a single queried peer.
#[derive(Debug)]
pub(crate) enum PeerReply {
    Nodes(Vec<Contact>),
    Value(SignedItem),
}

/// A query that produced no usable reply: transport failure, timeout, or a
/// protocol violation. Failure accounting happens in the RPC layer; the
/// lookup only drops the peer from its shortlist.
#[derive(Debug)]
pub(crate) struct QueryFailed;

/// The single network operation a lookup needs.
#[async_trait]
pub(crate) trait LookupRpc: Clone + Send + Sync + 'static {
    async fn query(
        &self,
        peer: &Contact,
        kind: LookupKind,
        target: NodeId,
    ) -> Result<PeerReply, QueryFailed>;
}

pub(crate) enum LookupOutcome {
    /// K closest peers that answered, sorted by distance to the target.
    Nodes(Vec<Contact>),
    /// A verified item, plus the closest peer that answered without holding
    /// it — the opportunistic caching target.
    Value {
        item: SignedItem,
        cache_to: Option<Contact>,
    },
}

pub(crate) struct Lookup<R: LookupRpc> {
    rpc: R,
    clock: Arc<dyn Clock>,
    k: usize,
    alpha: usize,
    deadline_ms: u64,
    max_skew_ms: u64,
}

impl<R: LookupRpc> Lookup<R> {
    pub fn new(
        rpc: R,
        clock: Arc<dyn Clock>,
        k: usize,
        alpha: usize,
        deadline_ms: u64,
        max_skew_ms: u64,
    ) -> Self {
        Self {
            rpc,
            clock,
            k,
            alpha,
            deadline_ms,
            max_skew_ms,
        }
    }

    pub async fn run(
        &self,
        kind: LookupKind,
        target: NodeId,
        seeds: Vec<Contact>,
    ) -> Result<LookupOutcome, LookupError> {
        let mut shortlist: Vec<Contact> = Vec::new();
        for seed in seeds {
            if !shortlist.iter().any(|c| c.id == seed.id) {
                shortlist.push(seed);
            }
        }
        if shortlist.is_empty() {
            return Err(LookupError::NoPeers);
        }
        sort_by_distance(&mut shortlist, &target);

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.deadline_ms);
        let mut contacted: HashSet<NodeId> = HashSet::new();
        let mut responded: Vec<Contact> = Vec::new();
        let mut non_holders: Vec<Contact> = Vec::new();
        let mut nearest = shortlist[0].id;
        let mut pending: JoinSet<(Contact, Result<PeerReply, QueryFailed>)> = JoinSet::new();

        self.launch(kind, target, &shortlist, &mut contacted, &mut pending);

        loop {
            if pending.is_empty() {
                // Nothing in flight: force contact of close candidates that
                // were skipped while the nearest id had stopped improving.
                self.launch(kind, target, &shortlist, &mut contacted, &mut pending);
                if pending.is_empty() {
                    // The K nearest observed ids have all been queried.
                    return match kind {
                        LookupKind::FindNode => {
                            sort_by_distance(&mut responded, &target);
                            responded.truncate(self.k);
                            debug!(
                                target = &target.to_hex()[..8],
                                found = responded.len(),
                                queried = contacted.len(),
                                "node lookup converged"
                            );
                            Ok(LookupOutcome::Nodes(responded))
                        }
                        LookupKind::FindValue => Err(LookupError::ValueNotFound),
                    };
                }
            }

            let joined = tokio::select! {
                joined = pending.join_next() => joined,
                _ = tokio::time::sleep_until(deadline) => {
                    pending.abort_all();
                    return Err(LookupError::Timeout);
                }
            };
            let (peer, outcome) = match joined {
                Some(Ok(pair)) => pair,
                Some(Err(_)) | None => continue,
            };

            match outcome {
                Err(QueryFailed) => {
                    trace!(peer = &peer.id.to_hex()[..8], "lookup peer failed");
                    shortlist.retain(|c| c.id != peer.id);
                    self.launch(kind, target, &shortlist, &mut contacted, &mut pending);
                }
                Ok(PeerReply::Value(item)) => {
                    let valid = item.key == target
                        && item.verify(self.clock.wall_ms(), self.max_skew_ms).is_ok();
                    if valid {
                        pending.abort_all();
                        let cache_to = non_holders
                            .iter()
                            .min_by(|a, b| {
                                distance_cmp(&a.id.distance(&target), &b.id.distance(&target))
                            })
                            .cloned();
                        return Ok(LookupOutcome::Value { item, cache_to });
                    }
                    // An unverifiable value is a misbehaving peer, not a
                    // reason to abandon the requests already in flight.
                    debug!(
                        peer = &peer.id.to_hex()[..8],
                        "peer returned an invalid value"
                    );
                    shortlist.retain(|c| c.id != peer.id);
                    self.launch(kind, target, &shortlist, &mut contacted, &mut pending);
                }
                Ok(PeerReply::Nodes(nodes)) => {
                    if !responded.iter().any(|c| c.id == peer.id) {
                        responded.push(peer.clone());
                    }
                    if kind == LookupKind::FindValue {
                        non_holders.push(peer);
                    }
                    for node in nodes {
                        if contacted.contains(&node.id)
                            || shortlist.iter().any(|c| c.id == node.id)
                        {
                            continue;
                        }
                        shortlist.push(node);
                    }
                    sort_by_distance(&mut shortlist, &target);

                    let improved = shortlist.first().is_some_and(|first| {
                        distance_cmp(&first.id.distance(&target), &nearest.distance(&target))
                            == std::cmp::Ordering::Less
                    });
                    if improved {
                        nearest = shortlist[0].id;
                        self.launch(kind, target, &shortlist, &mut contacted, &mut pending);
                    }
                    // No progress: do not launch on this response's behalf.
                }
            }
        }
    }

    /// Step-3 loop: fill the α window with the closest uncontacted
    /// candidates from the K-nearest prefix of the shortlist.
    fn launch(
        &self,
        kind: LookupKind,
        target: NodeId,
        shortlist: &[Contact],
        contacted: &mut HashSet<NodeId>,
        pending: &mut JoinSet<(Contact, Result<PeerReply, QueryFailed>)>,
    ) {
        while pending.len() < self.alpha {
            let next = shortlist
                .iter()
                .take(self.k)
                .find(|c| !contacted.contains(&c.id))
                .cloned();
            let Some(peer) = next else { break };
            contacted.insert(peer.id);
            let rpc = self.rpc.clone();
            pending.spawn(async move {
                let result = rpc.query(&peer, kind, target).await;
                (peer, result)
            });
        }
    }
}

fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    contacts.sort_by(|a, b| distance_cmp(&a.id.distance(target), &b.id.distance(target)));
}
