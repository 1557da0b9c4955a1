//! # kadlink - Authenticated Kademlia Overlay
//!
//! kadlink lets peers discover each other, authenticate and keep encrypted
//! links to one another, independent of the payloads they carry:
//!
//! - **Identity**: Ed25519 public keys are peer identities (32 bytes)
//! - **Routing**: Kademlia buckets ordered by XOR distance
//! - **Lookup**: concurrent, disjoint-path iterative `FindNode`
//! - **Sessions**: every connection runs an ordered pipeline of negotiation
//!   stages (signed key exchange, AEAD transport, identity proof)
//! - **Dispatch**: inbound frames reach handlers through an opcode-indexed
//!   callback table
//!
//! ## Security Model
//!
//! - Ephemeral X25519 key exchange, signed by the ephemeral Ed25519 key
//! - Once the transport is secured, opcode and payload are sealed together
//!   with a per-direction counter nonce
//! - Each side signs the handshake transcript with its long-term key before
//!   it is admitted to the routing table
//! - **S/Kademlia PoW**: an optional admission policy requires identities to
//!   carry a proof-of-work
//! - Bounded frames and bounded deserialization
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API owning every other component |
//! | `identity` | Keypairs, identities, contacts, admission policies |
//! | `crypto` | Domain-separated signatures, key agreement, AEAD ciphers |
//! | `config` | Tunables shared by the node and the CLI |
//! | `routing` | XOR-metric bucketed routing table |
//! | `dht` | Iterative disjoint-path lookup engine |
//! | `session` | Secure-session pipeline and its stages |
//! | `dispatch` | Opcode-indexed callback dispatcher |
//! | `transport` | Frame codec and per-connection reader/writer tasks |
//! | `protocols` | Trait seam between lookup engine and network |
//! | `rpc` | Lookup and broadcast exchanges over links |
//! | `messages` | Wire message types and opcodes |

mod config;
mod crypto;
mod dht;
mod dispatch;
mod identity;
mod messages;
mod node;
mod protocols;
mod routing;
mod rpc;
mod session;
mod transport;

pub use config::{Config, ConfigError};
pub use crypto::{CipherSuite, CryptoError, KdfHash, NonceCounter, SessionCipher, SharedKey, SignatureError};
pub use dht::{DhtNode, LookupParams};
pub use dispatch::{CallbackError, CallbackResult, Dispatch, Dispatcher, Handler, HandlerId};
pub use identity::{AcceptAll, AdmissionPolicy, Contact, Identity, IdentityProof, Keypair, PoWError, PowAdmission};
pub use messages::{Message, Opcode};
pub use node::{Node, NodeTelemetry};
pub use protocols::LookupRpc;
pub use routing::{RoutingTable, UpdateOutcome};
pub use session::{
    Disconnect, IdentityStage, KeyExchangeStage, Pipeline, SecureSession, SecureTransportStage, Stage,
    StageError,
};
pub use transport::{read_frame, write_frame, Delivery, DisconnectReason, FrameError, Link, LinkSender, Role};
