//! # Sigilum — a peer-to-peer self-verifying key/value store
//!
//! Sigilum is a Kademlia-style distributed hash table over a 512-bit
//! SHA-512 keyspace in which every stored item carries a signature binding
//! it to its creator's public key. Any recipient verifies provenance and
//! integrity locally; no intermediary has to be trusted.
//!
//! ## Architecture
//!
//! The engine behind each [`Node`] is an actor: it owns the routing table,
//! the datastore and the pending-request map, and processes commands
//! sequentially. Handles are cheap to clone and communicate over async
//! channels. Lookups run as independent cooperative tasks that drive
//! requests through the engine's correlation layer.
//!
//! Transport and time are collaborators passed in at construction: the
//! engine sees a framed send half plus an inbound frame stream, and a
//! [`Clock`]. The crate ships a UDP datagram transport and an in-memory
//! fabric for tests and simulation.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | 512-bit ids, XOR metric, keypairs, contacts |
//! | `item` | Signed items: canonical form, build, verify |
//! | `routing` | Prefix-tree of k-buckets with replacement caches |
//! | `store` | Local datastore: precedence, expiry, republication |
//! | `messages` | Signed envelopes and typed payloads |
//! | `lookup` | Iterative α-way traversal |
//! | `node` | The engine actor and public handle |
//! | `transport` | UDP and in-memory transports |
//! | `protocols` | `Transport` and `Clock` collaborator traits |
//! | `config` | All tunables in one value |
//! | `crypto` | Domain-separated Ed25519 helpers |

pub mod config;
pub mod crypto;
pub mod identity;
pub mod item;
pub mod lookup;
pub mod messages;
pub mod node;
pub mod protocols;
mod routing;
mod store;
pub mod transport;

pub use config::Config;
pub use identity::{Contact, Keypair, NodeId};
pub use item::{derive_key, ItemError, SignedItem};
pub use lookup::LookupError;
pub use messages::PROTOCOL_VERSION;
pub use node::{JoinError, Node, NodeSnapshot, PublishError, StoreReport};
pub use protocols::{Clock, MockClock, SystemClock, Transport};
pub use transport::{MemoryNetwork, UdpTransport};
