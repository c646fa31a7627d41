//! # Wire protocol
//!
//! Every frame on the wire is one signed [`Envelope`] carrying a typed
//! [`Payload`]. Envelopes are serialized with bincode (fix-int encoding, hard
//! size limit on decode) and signed by the sender over the canonical form —
//! the same serialization with the signature field omitted. Field order is
//! fixed and integer widths explicit, so equal logical values produce
//! byte-identical canonical forms.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong` |
//! | `Store(item)` | `StoreOk` \| `StoreErr` |
//! | `FindNode(target)` | `Nodes(contacts)` |
//! | `FindValue(target)` | `Value(item)` \| `Nodes(contacts)` |
//!
//! `Error` is the out-of-band failure reply for requests that could not be
//! dispatched at all (malformed, unverifiable, wrong version, unsupported).

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SignatureError, ENVELOPE_SIGNATURE_DOMAIN};
use crate::identity::{Contact, Keypair, NodeId};
use crate::item::SignedItem;

/// Protocol version spoken by this build. Peers are compatible when the
/// major component matches.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum size of a stored value (1 MiB). Larger payloads should be chunked
/// by the embedder.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum size of a decoded frame: the largest value plus envelope
/// overhead. Decoding enforces this limit to bound memory per frame.
pub const MAX_FRAME_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 8192;

/// Per-request correlation id.
pub type RequestId = [u8; 16];

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
}

/// Errors raised while decoding or verifying a frame.
#[derive(Debug)]
pub enum WireError {
    /// The frame did not decode as an envelope.
    Decode(bincode::Error),
    /// `sender` is not the SHA-512 of `sender_public_key`.
    SenderBinding,
    /// The envelope signature did not verify.
    Signature(SignatureError),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Decode(e) => write!(f, "frame decode failed: {}", e),
            WireError::SenderBinding => {
                write!(f, "sender id does not match the sender public key")
            }
            WireError::Signature(e) => write!(f, "envelope signature invalid: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

/// Peer descriptor as it travels inside `Nodes` replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: String,
    pub version: String,
}

impl PeerInfo {
    pub fn from_contact(contact: &Contact) -> Self {
        Self {
            id: contact.id,
            address: contact.address.clone(),
            version: contact.version.clone(),
        }
    }

    pub fn into_contact(self) -> Contact {
        Contact::new(self.id, self.address, self.version)
    }
}

/// Out-of-band failure codes carried by `Payload::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Malformed,
    Signature,
    Version,
    Internal,
    Unsupported,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::Malformed => 1,
            ErrorCode::Signature => 2,
            ErrorCode::Version => 3,
            ErrorCode::Internal => 4,
            ErrorCode::Unsupported => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::Malformed),
            2 => Some(ErrorCode::Signature),
            3 => Some(ErrorCode::Version),
            4 => Some(ErrorCode::Internal),
            5 => Some(ErrorCode::Unsupported),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Ping,
    Pong,
    Store(SignedItem),
    StoreOk,
    StoreErr {
        reason: String,
    },
    FindNode {
        target: NodeId,
    },
    Nodes(Vec<PeerInfo>),
    FindValue {
        target: NodeId,
    },
    Value(SignedItem),
    Error {
        code: u8,
        detail: String,
        original_uuid: RequestId,
    },
}

impl Payload {
    /// Whether this payload opens an exchange (as opposed to answering one).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Payload::Ping
                | Payload::Store(_)
                | Payload::FindNode { .. }
                | Payload::FindValue { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping => "ping",
            Payload::Pong => "pong",
            Payload::Store(_) => "store",
            Payload::StoreOk => "store_ok",
            Payload::StoreErr { .. } => "store_err",
            Payload::FindNode { .. } => "find_node",
            Payload::Nodes(_) => "nodes",
            Payload::FindValue { .. } => "find_value",
            Payload::Value(_) => "value",
            Payload::Error { .. } => "error",
        }
    }
}

/// One signed frame.
///
/// `uuid` correlates a response with its request: a reply carries the uuid
/// of the request it answers (for `Error`, additionally as
/// `original_uuid`). `reply_port` tells socket transports where to reach the
/// sender, since the source port of a datagram need not be its listening
/// port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub uuid: RequestId,
    pub sender: NodeId,
    pub sender_public_key: [u8; 32],
    pub version: String,
    pub reply_port: u16,
    pub payload: Payload,
    pub sig: Vec<u8>,
}

/// The signed portion of an envelope: every field except `sig`, in wire
/// order. Serialized with the same options as the envelope itself.
#[derive(Serialize)]
struct SignedBody<'a> {
    uuid: &'a RequestId,
    sender: &'a NodeId,
    sender_public_key: &'a [u8; 32],
    version: &'a str,
    reply_port: u16,
    payload: &'a Payload,
}

impl Envelope {
    /// Build and sign an envelope from this node's keypair.
    pub fn seal(
        keypair: &Keypair,
        uuid: RequestId,
        version: &str,
        reply_port: u16,
        payload: Payload,
    ) -> Result<Self, WireError> {
        let sender = keypair.node_id();
        let sender_public_key = keypair.public_key_bytes();
        let body = SignedBody {
            uuid: &uuid,
            sender: &sender,
            sender_public_key: &sender_public_key,
            version,
            reply_port,
            payload: &payload,
        };
        let canonical = wire_options().serialize(&body).map_err(WireError::Decode)?;
        let sig = crypto::sign_with_domain(keypair, ENVELOPE_SIGNATURE_DOMAIN, &canonical);
        Ok(Self {
            uuid,
            sender,
            sender_public_key,
            version: version.to_string(),
            reply_port,
            payload,
            sig,
        })
    }

    /// Canonical byte stream covered by `sig`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, WireError> {
        let body = SignedBody {
            uuid: &self.uuid,
            sender: &self.sender,
            sender_public_key: &self.sender_public_key,
            version: &self.version,
            reply_port: self.reply_port,
            payload: &self.payload,
        };
        wire_options().serialize(&body).map_err(WireError::Decode)
    }

    /// Check the sender binding (`sender == SHA512(sender_public_key)`) and
    /// the envelope signature.
    pub fn verify(&self) -> Result<(), WireError> {
        if self.sender != NodeId::hash_of(&self.sender_public_key) {
            return Err(WireError::SenderBinding);
        }
        let canonical = self.canonical_bytes()?;
        crypto::verify_with_domain(
            &self.sender_public_key,
            ENVELOPE_SIGNATURE_DOMAIN,
            &canonical,
            &self.sig,
        )
        .map_err(WireError::Signature)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        wire_options().serialize(self).map_err(WireError::Decode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        wire_options().deserialize(bytes).map_err(WireError::Decode)
    }
}

/// Two protocol versions interoperate when their major components match.
pub fn version_compatible(ours: &str, theirs: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    match (major(ours), major(theirs)) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(payload: Payload) -> (Keypair, Envelope) {
        let keypair = Keypair::generate();
        let envelope = Envelope::seal(&keypair, [7u8; 16], PROTOCOL_VERSION, 9000, payload)
            .expect("seal");
        (keypair, envelope)
    }

    #[test]
    fn seal_verify_encode_round_trip() {
        let (_keypair, envelope) = sealed(Payload::FindNode {
            target: NodeId::hash_of(b"target"),
        });
        assert!(envelope.verify().is_ok());

        let bytes = envelope.encode().expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(decoded, envelope);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn canonical_form_is_stable_across_reparse() {
        let (_keypair, envelope) = sealed(Payload::Ping);
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.canonical_bytes().unwrap(),
            envelope.canonical_bytes().unwrap()
        );
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let (_keypair, mut envelope) = sealed(Payload::FindNode {
            target: NodeId::hash_of(b"target"),
        });
        envelope.payload = Payload::FindNode {
            target: NodeId::hash_of(b"elsewhere"),
        };
        assert!(matches!(
            envelope.verify(),
            Err(WireError::Signature(SignatureError::VerificationFailed))
        ));
    }

    #[test]
    fn forged_sender_id_rejected() {
        let (_keypair, mut envelope) = sealed(Payload::Ping);
        envelope.sender = NodeId::hash_of(b"someone else");
        assert!(matches!(envelope.verify(), Err(WireError::SenderBinding)));
    }

    #[test]
    fn garbage_and_truncated_frames_rejected() {
        assert!(Envelope::decode(&[0xff, 0xfe, 0xfd]).is_err());

        let (_keypair, envelope) = sealed(Payload::Pong);
        let bytes = envelope.encode().unwrap();
        assert!(Envelope::decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn request_response_classification() {
        assert!(Payload::Ping.is_request());
        assert!(Payload::FindValue {
            target: NodeId::MIN
        }
        .is_request());
        assert!(!Payload::Pong.is_request());
        assert!(!Payload::Nodes(vec![]).is_request());
        assert!(!Payload::Error {
            code: 1,
            detail: String::new(),
            original_uuid: [0u8; 16],
        }
        .is_request());
    }

    #[test]
    fn error_codes_round_trip() {
        for code in [
            ErrorCode::Malformed,
            ErrorCode::Signature,
            ErrorCode::Version,
            ErrorCode::Internal,
            ErrorCode::Unsupported,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(9), None);
    }

    #[test]
    fn version_compatibility_is_major_only() {
        assert!(version_compatible("1.0.0", "1.4.2"));
        assert!(!version_compatible("1.0.0", "2.0.0"));
        assert!(!version_compatible("1.0.0", ""));
    }

    #[test]
    fn peer_info_contact_round_trip() {
        let contact = Contact::new(NodeId::hash_of(b"peer"), "10.0.0.1:4000", "1.0.0");
        let info = PeerInfo::from_contact(&contact);
        let back = info.into_contact();
        assert_eq!(back.id, contact.id);
        assert_eq!(back.address, contact.address);
        assert_eq!(back.failed_rpcs, 0);
    }
}
