//! # Self-verifying items
//!
//! A [`SignedItem`] is a key/value record that carries its own provenance.
//! The creator signs a canonical serialization of the payload fields with
//! their Ed25519 key, and the DHT key is derived from the public key and the
//! item name. Any recipient can therefore check, without trusting the peer
//! that delivered it:
//!
//! - that the fields have not been tampered with (`sig`),
//! - that the key really belongs to this publisher and name (`key`),
//! - that the record is neither expired nor from the future.
//!
//! ## Canonical form
//!
//! The signature covers exactly this byte stream, in this field order:
//!
//! ```text
//! lp(value) || timestamp(8, LE) || expires(8, LE) || lp(name)
//!   || meta_count(4, LE) || [lp(key) || lp(val)]* || lp(created_with)
//!   || lp(public_key)
//! ```
//!
//! where `lp(x)` is a 4-byte little-endian length prefix followed by the
//! bytes of `x`, and `meta` pairs appear in the order given by the creator.
//! The DHT key is `SHA512(lp(public_key) || lp(name))`.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, SignatureError, ITEM_SIGNATURE_DOMAIN};
use crate::identity::{Keypair, NodeId};
use crate::messages::MAX_VALUE_SIZE;

/// Maximum number of metadata pairs accepted in one item.
const MAX_META_PAIRS: usize = 64;

/// Maximum length of the item name in bytes.
const MAX_NAME_LEN: usize = 1024;

/// Maximum length of a single metadata key or value in bytes.
const MAX_META_FIELD_LEN: usize = 4096;

/// Why an item failed validation. All failures are final: the item must not
/// be stored or propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemError {
    /// A field is missing, out of bounds, or ill-typed.
    Malformed(&'static str),
    /// The recomputed key does not match the `key` field.
    BadKey,
    /// The signature does not verify against the public key.
    BadSignature,
    /// `expires` lies in the past.
    Expired,
    /// `timestamp` lies further in the future than the allowed skew.
    FutureTimestamp,
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemError::Malformed(what) => write!(f, "malformed item: {}", what),
            ItemError::BadKey => write!(f, "key does not match public key and name"),
            ItemError::BadSignature => write!(f, "signature verification failed"),
            ItemError::Expired => write!(f, "item has expired"),
            ItemError::FutureTimestamp => write!(f, "item timestamp is in the future"),
        }
    }
}

impl std::error::Error for ItemError {}

/// A signed, self-contained key/value record.
///
/// Timestamps are wall-clock milliseconds since the Unix epoch as observed
/// by the creator. `expires == 0` means the item never expires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedItem {
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub expires: u64,
    pub name: String,
    pub meta: Vec<(String, String)>,
    pub created_with: String,
    pub public_key: [u8; 32],
    pub sig: Vec<u8>,
    pub key: NodeId,
}

impl SignedItem {
    /// Build and sign a complete item.
    ///
    /// `wall_now_ms` becomes the creation timestamp; the key is derived from
    /// the keypair's public key and `name`.
    pub fn build(
        keypair: &Keypair,
        name: impl Into<String>,
        value: Vec<u8>,
        expires: u64,
        meta: Vec<(String, String)>,
        created_with: impl Into<String>,
        wall_now_ms: u64,
    ) -> Result<Self, ItemError> {
        let name = name.into();
        let created_with = created_with.into();
        let timestamp = wall_now_ms;

        if expires != 0 && expires <= timestamp {
            return Err(ItemError::Malformed("expires not after timestamp"));
        }
        check_bounds(&value, &name, &meta)?;

        let public_key = keypair.public_key_bytes();
        let canonical = canonical_signed_fields(
            &value,
            timestamp,
            expires,
            &name,
            &meta,
            &created_with,
            &public_key,
        );
        let sig = crypto::sign_with_domain(keypair, ITEM_SIGNATURE_DOMAIN, &canonical);
        let key = derive_key(&public_key, &name);

        Ok(Self {
            value,
            timestamp,
            expires,
            name,
            meta,
            created_with,
            public_key,
            sig,
            key,
        })
    }

    /// The canonical byte stream covered by this item's signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_signed_fields(
            &self.value,
            self.timestamp,
            self.expires,
            &self.name,
            &self.meta,
            &self.created_with,
            &self.public_key,
        )
    }

    /// Full validation: structure, key derivation, signature, freshness.
    pub fn verify(&self, wall_now_ms: u64, max_skew_ms: u64) -> Result<(), ItemError> {
        check_bounds(&self.value, &self.name, &self.meta)?;
        if self.expires != 0 && self.expires <= self.timestamp {
            return Err(ItemError::Malformed("expires not after timestamp"));
        }

        if derive_key(&self.public_key, &self.name) != self.key {
            return Err(ItemError::BadKey);
        }

        let canonical = self.canonical_bytes();
        match crypto::verify_with_domain(
            &self.public_key,
            ITEM_SIGNATURE_DOMAIN,
            &canonical,
            &self.sig,
        ) {
            Ok(()) => {}
            Err(SignatureError::VerificationFailed) => return Err(ItemError::BadSignature),
            Err(SignatureError::Missing) | Err(SignatureError::InvalidLength) => {
                return Err(ItemError::Malformed("signature"))
            }
            Err(SignatureError::InvalidPublicKey) => {
                return Err(ItemError::Malformed("public key"))
            }
        }

        if self.expires != 0 && self.expires < wall_now_ms {
            return Err(ItemError::Expired);
        }
        if self.timestamp > wall_now_ms.saturating_add(max_skew_ms) {
            return Err(ItemError::FutureTimestamp);
        }

        Ok(())
    }

    /// Ordering rule for two items under the same key: larger `timestamp`
    /// wins, ties broken by lexicographically larger signature bytes.
    pub fn supersedes(&self, other: &SignedItem) -> bool {
        (self.timestamp, self.sig.as_slice()) > (other.timestamp, other.sig.as_slice())
    }
}

/// Derive the DHT key for a publisher/name pair:
/// `SHA512(lp(public_key) || lp(name))`.
pub fn derive_key(public_key: &[u8; 32], name: &str) -> NodeId {
    let mut buf = Vec::with_capacity(4 + 32 + 4 + name.len());
    put_prefixed(&mut buf, public_key);
    put_prefixed(&mut buf, name.as_bytes());
    NodeId::hash_of(&buf)
}

fn check_bounds(
    value: &[u8],
    name: &str,
    meta: &[(String, String)],
) -> Result<(), ItemError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(ItemError::Malformed("value too large"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ItemError::Malformed("name too long"));
    }
    if meta.len() > MAX_META_PAIRS {
        return Err(ItemError::Malformed("too many meta pairs"));
    }
    for (k, v) in meta {
        if k.len() > MAX_META_FIELD_LEN || v.len() > MAX_META_FIELD_LEN {
            return Err(ItemError::Malformed("meta field too long"));
        }
    }
    Ok(())
}

fn put_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn canonical_signed_fields(
    value: &[u8],
    timestamp: u64,
    expires: u64,
    name: &str,
    meta: &[(String, String)],
    created_with: &str,
    public_key: &[u8; 32],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + name.len() + 128);
    put_prefixed(&mut buf, value);
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&expires.to_le_bytes());
    put_prefixed(&mut buf, name.as_bytes());
    buf.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    for (k, v) in meta {
        put_prefixed(&mut buf, k.as_bytes());
        put_prefixed(&mut buf, v.as_bytes());
    }
    put_prefixed(&mut buf, created_with.as_bytes());
    put_prefixed(&mut buf, public_key);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;
    const SKEW: u64 = 60_000;

    fn sample(keypair: &Keypair) -> SignedItem {
        SignedItem::build(
            keypair,
            "greeting",
            b"hello".to_vec(),
            0,
            vec![("lang".into(), "en".into())],
            "1.0.0",
            NOW,
        )
        .expect("build")
    }

    #[test]
    fn build_then_verify_ok() {
        let keypair = Keypair::generate();
        let item = sample(&keypair);
        assert_eq!(item.verify(NOW, SKEW), Ok(()));
        assert_eq!(item.key, derive_key(&keypair.public_key_bytes(), "greeting"));
    }

    #[test]
    fn tampered_value_fails_signature() {
        let keypair = Keypair::generate();
        let mut item = sample(&keypair);
        item.value[0] ^= 0x01;
        assert_eq!(item.verify(NOW, SKEW), Err(ItemError::BadSignature));
    }

    #[test]
    fn tampered_meta_fails_signature() {
        let keypair = Keypair::generate();
        let mut item = sample(&keypair);
        item.meta[0].1 = "fr".into();
        assert_eq!(item.verify(NOW, SKEW), Err(ItemError::BadSignature));
    }

    #[test]
    fn wrong_key_detected_before_signature() {
        let keypair = Keypair::generate();
        let mut item = sample(&keypair);
        item.key = NodeId::hash_of(b"somewhere else");
        assert_eq!(item.verify(NOW, SKEW), Err(ItemError::BadKey));
    }

    #[test]
    fn renamed_item_fails_key_check() {
        // Renaming changes the derived key, so a stolen name cannot keep the
        // original key slot.
        let keypair = Keypair::generate();
        let mut item = sample(&keypair);
        item.name = "other".into();
        assert_eq!(item.verify(NOW, SKEW), Err(ItemError::BadKey));
    }

    #[test]
    fn expired_item_rejected() {
        let keypair = Keypair::generate();
        let item = SignedItem::build(
            &keypair,
            "ttl",
            b"v".to_vec(),
            NOW + 1_000,
            vec![],
            "1.0.0",
            NOW,
        )
        .expect("build");
        assert_eq!(item.verify(NOW, SKEW), Ok(()));
        assert_eq!(item.verify(NOW + 2_000, SKEW), Err(ItemError::Expired));
    }

    #[test]
    fn future_timestamp_rejected() {
        let keypair = Keypair::generate();
        let item = SignedItem::build(
            &keypair,
            "early",
            b"v".to_vec(),
            0,
            vec![],
            "1.0.0",
            NOW + SKEW + 1,
        )
        .expect("build");
        assert_eq!(item.verify(NOW, SKEW), Err(ItemError::FutureTimestamp));
        // Within the allowed skew it passes.
        assert_eq!(item.verify(NOW + 1, SKEW), Ok(()));
    }

    #[test]
    fn expires_must_follow_timestamp() {
        let keypair = Keypair::generate();
        let result = SignedItem::build(
            &keypair,
            "bad",
            b"v".to_vec(),
            NOW - 1,
            vec![],
            "1.0.0",
            NOW,
        );
        assert_eq!(
            result,
            Err(ItemError::Malformed("expires not after timestamp"))
        );
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        let keypair = Keypair::generate();
        let item = sample(&keypair);
        let bytes = bincode::serialize(&item).expect("serialize");
        let parsed: SignedItem = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(parsed.canonical_bytes(), item.canonical_bytes());
        assert_eq!(parsed, item);
    }

    #[test]
    fn meta_order_is_significant() {
        let keypair = Keypair::generate();
        let forward = SignedItem::build(
            &keypair,
            "n",
            b"v".to_vec(),
            0,
            vec![("a".into(), "1".into()), ("b".into(), "2".into())],
            "1.0.0",
            NOW,
        )
        .expect("build");
        let reversed = SignedItem::build(
            &keypair,
            "n",
            b"v".to_vec(),
            0,
            vec![("b".into(), "2".into()), ("a".into(), "1".into())],
            "1.0.0",
            NOW,
        )
        .expect("build");
        assert_ne!(forward.canonical_bytes(), reversed.canonical_bytes());
        assert_ne!(forward.sig, reversed.sig);
    }

    #[test]
    fn supersedes_orders_by_timestamp_then_sig() {
        let keypair = Keypair::generate();
        let older = SignedItem::build(&keypair, "n", b"v1".to_vec(), 0, vec![], "1.0.0", NOW)
            .expect("build");
        let newer = SignedItem::build(&keypair, "n", b"v2".to_vec(), 0, vec![], "1.0.0", NOW + 1)
            .expect("build");
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(!older.supersedes(&older));

        // Same timestamp: the lexicographically larger signature wins, and
        // the relation stays antisymmetric.
        let twin_a = SignedItem::build(&keypair, "n", b"va".to_vec(), 0, vec![], "1.0.0", NOW)
            .expect("build");
        let twin_b = SignedItem::build(&keypair, "n", b"vb".to_vec(), 0, vec![], "1.0.0", NOW)
            .expect("build");
        assert_ne!(twin_a.supersedes(&twin_b), twin_b.supersedes(&twin_a));
    }
}
