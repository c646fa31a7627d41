//! # Identities and the XOR keyspace
//!
//! Everything in the network — peers and stored items alike — lives in a
//! single 512-bit keyspace:
//!
//! - [`NodeId`]: a 512-bit identifier, normally a SHA-512 digest
//! - [`Keypair`]: the Ed25519 signing keypair behind a peer's identity
//! - [`Contact`]: a routing record for a known peer
//!
//! ## Identity model
//!
//! A peer's id is `SHA512(public_key)`. An item's key is the SHA-512 of the
//! canonical concatenation of the publisher's public key and the item name
//! (see `item::derive_key`), so peers and data share one metric space.
//!
//! ## Distance
//!
//! `distance(a, b) = a XOR b`, interpreted as a 512-bit big-endian integer;
//! smaller is closer. The distance is symmetric, zero only for `a == b`, and
//! satisfies the XOR triangle identity, which is what makes bucketed prefix
//! routing converge.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::{Error as DeError, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

/// Width of the keyspace in bits.
pub const ID_BITS: usize = 512;

/// Width of the keyspace in bytes.
pub const ID_BYTES: usize = 64;

/// A 512-bit identifier in the shared XOR keyspace.
///
/// Stored big-endian, so the derived `Ord` is numeric order over the
/// keyspace and lexicographic comparison of XOR distances is numeric
/// comparison.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0u8; ID_BYTES]);
    pub const MAX: NodeId = NodeId([0xff; ID_BYTES]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// SHA-512 of arbitrary input, interpreted big-endian.
    pub fn hash_of(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// XOR distance to another id.
    #[inline]
    pub fn distance(&self, other: &NodeId) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index of the bucket that would hold `other` relative to `self` in a
    /// fully-split table: the number of leading zero bits in the XOR
    /// distance, i.e. `ID_BITS - 1 - floor(log2(distance))`. `None` when the
    /// ids are equal (distance zero has no bucket).
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let dist = self.distance(other);
        let zeros = leading_zero_bits(&dist);
        if zeros == ID_BITS {
            None
        } else {
            Some(zeros)
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// serde only derives array impls up to 32 elements, so the 64-byte id
// serializes as a length-checked byte string.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{} bytes", ID_BYTES)
            }

            fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<NodeId, E> {
                if v.len() != ID_BYTES {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut arr = [0u8; ID_BYTES];
                arr.copy_from_slice(v);
                Ok(NodeId(arr))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<NodeId, A::Error> {
                let mut arr = [0u8; ID_BYTES];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| A::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(arr))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

/// Number of leading zero bits in a distance.
#[inline]
pub fn leading_zero_bits(dist: &[u8; ID_BYTES]) -> usize {
    let mut zeros = 0usize;
    for byte in dist {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros() as usize;
            break;
        }
    }
    zeros
}

/// Compare two XOR distances numerically (big-endian lexicographic).
#[inline]
pub fn distance_cmp(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Ed25519 signing keypair behind a peer identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The peer id derived from this keypair: `SHA512(public_key)`.
    pub fn node_id(&self) -> NodeId {
        NodeId::hash_of(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id().to_hex())
            .finish_non_exhaustive()
    }
}

/// Routing record for a known peer.
///
/// `id` is immutable for the life of the record. `last_seen_ms` is updated on
/// every successfully verified inbound message from the peer; `failed_rpcs`
/// counts unanswered or transport-failed requests and is reset by any valid
/// response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub address: String,
    pub version: String,
    pub last_seen_ms: u64,
    pub failed_rpcs: u32,
}

impl Contact {
    pub fn new(id: NodeId, address: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            version: version.into(),
            last_seen_ms: 0,
            failed_rpcs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha512_known_vector() {
        // SHA-512("abc") from FIPS 180-4.
        let id = NodeId::hash_of(b"abc");
        assert_eq!(
            id.to_hex(),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn hex_round_trip() {
        let id = NodeId::hash_of(b"round trip");
        let parsed = NodeId::from_hex(&id.to_hex()).expect("parse");
        assert_eq!(id, parsed);

        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = NodeId::hash_of(b"a");
        let b = NodeId::hash_of(b"b");
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; ID_BYTES]);
    }

    #[test]
    fn distance_ordering_matches_integer_xor() {
        let mut near = [0u8; ID_BYTES];
        near[ID_BYTES - 1] = 0x01;
        let mut far = [0u8; ID_BYTES];
        far[0] = 0x80;

        let origin = NodeId::MIN;
        let d_near = origin.distance(&NodeId::from_bytes(near));
        let d_far = origin.distance(&NodeId::from_bytes(far));
        assert_eq!(distance_cmp(&d_near, &d_far), std::cmp::Ordering::Less);
    }

    #[test]
    fn bucket_index_counts_shared_prefix() {
        let zero = NodeId::MIN;

        let mut top = [0u8; ID_BYTES];
        top[0] = 0x80;
        assert_eq!(zero.bucket_index(&NodeId::from_bytes(top)), Some(0));

        let mut low = [0u8; ID_BYTES];
        low[ID_BYTES - 1] = 0x01;
        assert_eq!(zero.bucket_index(&NodeId::from_bytes(low)), Some(ID_BITS - 1));

        assert_eq!(zero.bucket_index(&zero), None);
    }

    #[test]
    fn node_id_serde_round_trip() {
        let id = NodeId::hash_of(b"serde");
        let bytes = bincode::serialize(&id).expect("serialize");
        let back: NodeId = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(id, back);
    }

    #[test]
    fn keypair_id_binds_public_key() {
        let keypair = Keypair::generate();
        assert_eq!(
            keypair.node_id(),
            NodeId::hash_of(&keypair.public_key_bytes())
        );

        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.node_id(), keypair.node_id());
    }
}
