//! # Routing table
//!
//! A binary prefix tree of k-buckets over the 512-bit keyspace, stored as an
//! ordered list of leaves. Bucket ranges are inclusive `[lo, hi]` blocks that
//! partition the whole keyspace; a full bucket whose range contains our own
//! id splits at its midpoint, every other full bucket feeds a bounded
//! replacement cache instead.
//!
//! Contacts within a bucket are kept oldest-first. The stalest contact is the
//! eviction candidate: when a full, unsplittable bucket receives a fresh
//! candidate, the caller is asked to probe the bucket head and report back
//! via [`RoutingTable::apply_head_probe`].

use std::collections::VecDeque;

use rand::Rng;
use tracing::{debug, trace};

use crate::identity::{distance_cmp, leading_zero_bits, Contact, NodeId, ID_BYTES};

/// An inclusive, power-of-two-aligned block of the keyspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub lo: NodeId,
    pub hi: NodeId,
}

impl KeyRange {
    /// The whole keyspace, `[0, 2^512 - 1]`.
    pub fn full() -> Self {
        Self {
            lo: NodeId::MIN,
            hi: NodeId::MAX,
        }
    }

    #[inline]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.lo <= *id && *id <= self.hi
    }

    /// Split at the midpoint into two halves covering the same range.
    pub fn split(&self) -> (KeyRange, KeyRange) {
        let mid = midpoint(self.lo.as_bytes(), self.hi.as_bytes());
        let left = KeyRange {
            lo: self.lo,
            hi: NodeId::from_bytes(mid),
        };
        let right = KeyRange {
            lo: NodeId::from_bytes(add_one(&mid)),
            hi: self.hi,
        };
        (left, right)
    }

    /// A uniformly random id inside the range.
    ///
    /// Relies on the range being an aligned block: where `lo` and `hi` agree
    /// the bit is fixed, everywhere else `lo` carries 0 and `hi` carries 1,
    /// so a random choice of the disagreeing bits stays in range.
    pub fn random_id<R: Rng>(&self, rng: &mut R) -> NodeId {
        let lo = self.lo.as_bytes();
        let hi = self.hi.as_bytes();
        let mut out = [0u8; ID_BYTES];
        rng.fill(&mut out[..]);
        for i in 0..ID_BYTES {
            let same = !(lo[i] ^ hi[i]);
            out[i] = (lo[i] & same) | (out[i] & !same);
        }
        let id = NodeId::from_bytes(out);
        debug_assert!(self.contains(&id));
        id
    }

    /// The id within the range nearest to `id` (identity when contained).
    fn clamp(&self, id: &NodeId) -> NodeId {
        if *id < self.lo {
            self.lo
        } else if *id > self.hi {
            self.hi
        } else {
            *id
        }
    }
}

fn midpoint(lo: &[u8; ID_BYTES], hi: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    // lo + (hi - lo) / 2, all big-endian.
    let mut diff = [0u8; ID_BYTES];
    let mut borrow = 0i16;
    for i in (0..ID_BYTES).rev() {
        let d = hi[i] as i16 - lo[i] as i16 - borrow;
        if d < 0 {
            diff[i] = (d + 256) as u8;
            borrow = 1;
        } else {
            diff[i] = d as u8;
            borrow = 0;
        }
    }
    debug_assert_eq!(borrow, 0, "range bounds inverted");

    let mut half = [0u8; ID_BYTES];
    let mut carry = 0u8;
    for i in 0..ID_BYTES {
        half[i] = (diff[i] >> 1) | (carry << 7);
        carry = diff[i] & 1;
    }

    let mut out = [0u8; ID_BYTES];
    let mut carry = 0u16;
    for i in (0..ID_BYTES).rev() {
        let sum = lo[i] as u16 + half[i] as u16 + carry;
        out[i] = sum as u8;
        carry = sum >> 8;
    }
    out
}

fn add_one(bytes: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = *bytes;
    for i in (0..ID_BYTES).rev() {
        let (sum, overflow) = out[i].overflowing_add(1);
        out[i] = sum;
        if !overflow {
            break;
        }
    }
    out
}

enum BucketAdd {
    Added,
    Refreshed,
    Full,
}

/// One leaf of the prefix tree: up to `k` contacts, oldest first, plus a
/// FIFO replacement cache of candidates that arrived while the bucket was
/// full and unsplittable.
struct Bucket {
    range: KeyRange,
    contacts: Vec<Contact>,
    cache: VecDeque<Contact>,
    last_accessed_ms: u64,
}

impl Bucket {
    fn new(range: KeyRange, now_ms: u64) -> Self {
        Self {
            range,
            contacts: Vec::new(),
            cache: VecDeque::new(),
            last_accessed_ms: now_ms,
        }
    }

    fn add(&mut self, contact: Contact, k: usize) -> BucketAdd {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            BucketAdd::Refreshed
        } else if self.contacts.len() < k {
            self.contacts.push(contact);
            BucketAdd::Added
        } else {
            BucketAdd::Full
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| &c.id == id)?;
        Some(self.contacts.remove(pos))
    }

    fn head(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// FIFO with dedup by id; a re-seen candidate moves to the fresh end.
    fn push_cache(&mut self, contact: Contact, cap: usize) {
        if let Some(pos) = self.cache.iter().position(|c| c.id == contact.id) {
            self.cache.remove(pos);
        } else if self.cache.len() >= cap {
            self.cache.pop_front();
        }
        self.cache.push_back(contact);
    }

    /// The freshest cached candidate, if any.
    fn promote_cached(&mut self) -> Option<Contact> {
        self.cache.pop_back()
    }
}

/// What became of an offered contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The contact carries our own id and was dropped.
    SelfId,
    /// Inserted as a new entry.
    Added,
    /// Already known; moved to the fresh end of its bucket.
    Refreshed,
    /// Bucket full and unsplittable: the candidate went to the replacement
    /// cache. The caller should probe the returned bucket head and report
    /// the outcome through [`RoutingTable::apply_head_probe`].
    Cached { probe_head: Contact },
}

pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    max_failures: u32,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize, max_failures: u32, now_ms: u64) -> Self {
        Self {
            self_id,
            k,
            max_failures,
            buckets: vec![Bucket::new(KeyRange::full(), now_ms)],
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn contact_count(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.buckets[self.bucket_index_for(id)]
            .contacts
            .iter()
            .find(|c| &c.id == id)
    }

    fn bucket_index_for(&self, id: &NodeId) -> usize {
        // Buckets are ordered by range; the first whose upper bound reaches
        // the id is the unique owner.
        self.buckets.partition_point(|b| b.range.hi < *id)
    }

    /// Offer a contact observed on the wire.
    ///
    /// A known contact is refreshed (failure counter cleared); a new one is
    /// appended if there is room. A full bucket covering our own id splits at
    /// the midpoint and the insertion retries into the right half; any other
    /// full bucket sends the candidate to its replacement cache and asks the
    /// caller to probe the stalest entry.
    pub fn insert(&mut self, mut contact: Contact, now_ms: u64) -> InsertOutcome {
        if contact.id == self.self_id {
            return InsertOutcome::SelfId;
        }
        contact.failed_rpcs = 0;
        contact.last_seen_ms = now_ms;

        loop {
            let idx = self.bucket_index_for(&contact.id);
            match self.buckets[idx].add(contact.clone(), self.k) {
                BucketAdd::Added => {
                    self.buckets[idx].last_accessed_ms = now_ms;
                    return InsertOutcome::Added;
                }
                BucketAdd::Refreshed => {
                    self.buckets[idx].last_accessed_ms = now_ms;
                    return InsertOutcome::Refreshed;
                }
                BucketAdd::Full => {
                    if self.buckets[idx].range.contains(&self.self_id) {
                        self.split(idx, now_ms);
                        continue;
                    }
                    let head = self.buckets[idx]
                        .head()
                        .cloned()
                        .unwrap_or_else(|| contact.clone());
                    self.buckets[idx].push_cache(contact, self.k);
                    return InsertOutcome::Cached { probe_head: head };
                }
            }
        }
    }

    fn split(&mut self, idx: usize, now_ms: u64) {
        let (left_range, right_range) = self.buckets[idx].range.split();
        debug!(
            lo = &left_range.lo.to_hex()[..8],
            hi = &right_range.hi.to_hex()[..8],
            "splitting bucket"
        );
        let old = std::mem::replace(&mut self.buckets[idx], Bucket::new(left_range, now_ms));
        let mut right = Bucket::new(right_range, old.last_accessed_ms);
        let left = &mut self.buckets[idx];
        left.last_accessed_ms = old.last_accessed_ms;

        for contact in old.contacts {
            if right.range.contains(&contact.id) {
                right.contacts.push(contact);
            } else {
                left.contacts.push(contact);
            }
        }
        for contact in old.cache {
            if right.range.contains(&contact.id) {
                right.cache.push_back(contact);
            } else {
                left.cache.push_back(contact);
            }
        }
        self.buckets.insert(idx + 1, right);
    }

    /// Outcome of a liveness probe on a bucket head requested by
    /// [`InsertOutcome::Cached`]. A live head moves to the fresh end of its
    /// bucket; a dead one is evicted and replaced from the cache.
    pub fn apply_head_probe(&mut self, head_id: &NodeId, alive: bool, now_ms: u64) {
        let idx = self.bucket_index_for(head_id);
        let bucket = &mut self.buckets[idx];
        if alive {
            if let Some(pos) = bucket.contacts.iter().position(|c| &c.id == head_id) {
                let mut head = bucket.contacts.remove(pos);
                head.last_seen_ms = now_ms;
                head.failed_rpcs = 0;
                bucket.contacts.push(head);
            }
            return;
        }

        if bucket.remove(head_id).is_some() {
            trace!(head = &head_id.to_hex()[..8], "evicted unresponsive bucket head");
        }
        if bucket.contacts.len() < self.k {
            if let Some(replacement) = bucket.promote_cached() {
                bucket.contacts.push(replacement);
            }
        }
    }

    /// Record a failed request. At `max_failures` the contact is removed and
    /// the freshest cache entry takes its slot. Returns the evicted contact.
    pub fn record_failure(&mut self, id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index_for(id);
        let bucket = &mut self.buckets[idx];
        let contact = bucket.contacts.iter_mut().find(|c| &c.id == id)?;
        contact.failed_rpcs += 1;
        if contact.failed_rpcs < self.max_failures {
            return None;
        }
        let evicted = bucket.remove(id);
        if let Some(evicted) = &evicted {
            debug!(
                peer = &evicted.id.to_hex()[..8],
                failures = evicted.failed_rpcs,
                "removing contact after repeated failures"
            );
        }
        if bucket.contacts.len() < self.k {
            if let Some(replacement) = bucket.promote_cached() {
                bucket.contacts.push(replacement);
            }
        }
        evicted
    }

    /// Record a valid response: clears the failure counter and freshens the
    /// contact's position.
    pub fn record_success(&mut self, id: &NodeId, now_ms: u64) {
        let idx = self.bucket_index_for(id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.contacts.iter().position(|c| &c.id == id) {
            let mut contact = bucket.contacts.remove(pos);
            contact.failed_rpcs = 0;
            contact.last_seen_ms = now_ms;
            bucket.contacts.push(contact);
            bucket.last_accessed_ms = now_ms;
        }
    }

    /// Up to `count` known contacts closest to `target` by XOR distance,
    /// optionally excluding one id (the requester of a FIND_NODE).
    pub fn k_closest(
        &self,
        target: &NodeId,
        count: usize,
        exclude: Option<&NodeId>,
    ) -> Vec<Contact> {
        let mut pool: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| exclude != Some(&c.id))
            .cloned()
            .collect();
        pool.sort_unstable_by(|a, b| {
            distance_cmp(&a.id.distance(target), &b.id.distance(target))
        });
        pool.truncate(count);
        pool
    }

    /// Whether we are one of the `k` closest known nodes to `key`, counting
    /// ourselves against the contacts in the table. Items stored under keys
    /// for which this is false are caching copies.
    pub fn is_among_k_closest(&self, key: &NodeId) -> bool {
        let closest = self.k_closest(key, self.k, None);
        if closest.len() < self.k {
            return true;
        }
        let own = self.self_id.distance(key);
        let kth = closest[self.k - 1].id.distance(key);
        distance_cmp(&own, &kth) != std::cmp::Ordering::Greater
    }

    /// Mark the bucket covering `target` as freshly used.
    pub fn touch_bucket(&mut self, target: &NodeId, now_ms: u64) {
        let idx = self.bucket_index_for(target);
        self.buckets[idx].last_accessed_ms = now_ms;
    }

    /// Random lookup targets for every bucket untouched for
    /// `stale_after_ms`; issuing the lookups refills the buckets as a side
    /// effect.
    pub fn refresh_targets<R: Rng>(
        &self,
        now_ms: u64,
        stale_after_ms: u64,
        rng: &mut R,
    ) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter(|b| now_ms.saturating_sub(b.last_accessed_ms) >= stale_after_ms)
            .map(|b| b.range.random_id(rng))
            .collect()
    }

    /// Common prefix length between our id and a bucket's range (the length
    /// of the prefix shared with the nearest id inside the range).
    fn bucket_cpl(&self, bucket: &Bucket) -> usize {
        let rep = bucket.range.clamp(&self.self_id);
        leading_zero_bits(&self.self_id.distance(&rep))
    }

    /// Random targets for every bucket farther from our id than the bucket
    /// holding our closest neighbor. Used once after joining.
    pub fn join_refresh_targets<R: Rng>(&self, rng: &mut R) -> Vec<NodeId> {
        let neighbor = match self.k_closest(&self.self_id, 1, None).into_iter().next() {
            Some(c) => c,
            None => return Vec::new(),
        };
        let neighbor_cpl = {
            let idx = self.bucket_index_for(&neighbor.id);
            self.bucket_cpl(&self.buckets[idx])
        };
        self.buckets
            .iter()
            .filter(|b| self.bucket_cpl(b) < neighbor_cpl)
            .map(|b| b.range.random_id(rng))
            .collect()
    }

    #[cfg(test)]
    fn assert_partition(&self) {
        assert_eq!(self.buckets[0].range.lo, NodeId::MIN);
        assert_eq!(self.buckets[self.buckets.len() - 1].range.hi, NodeId::MAX);
        for pair in self.buckets.windows(2) {
            assert_eq!(
                *pair[1].range.lo.as_bytes(),
                add_one(pair[0].range.hi.as_bytes()),
                "gap or overlap between adjacent buckets"
            );
        }
        for bucket in &self.buckets {
            assert!(bucket.contacts.len() <= self.k);
            for contact in &bucket.contacts {
                assert!(bucket.range.contains(&contact.id));
                assert_ne!(contact.id, self.self_id);
            }
        }
    }
}
