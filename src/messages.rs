//! # Wire Protocol Messages
//!
//! Payloads are bincode-encoded and carried in frames tagged with a one-byte
//! [`Opcode`]. Deserialization is always bounded to prevent memory
//! exhaustion from hostile length prefixes.
//!
//! | Opcode | Message | Direction |
//! |--------|---------|-----------|
//! | `0x01` | [`Handshake`] | both, plaintext |
//! | `0x02` | transport ACK (empty) | both, plaintext |
//! | `0x03` | [`IdentityAnnouncement`] | both, sealed |
//! | `0x10` | [`LookupNodeRequest`] | sealed |
//! | `0x11` | [`LookupNodeResponse`] | sealed |
//! | `0x20` | [`Broadcast`] | sealed |

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Contact, Identity, IdentityProof};

/// Maximum frame body size on the wire (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_FRAME_SIZE as u64;

/// One-byte message kind used to address the dispatcher.
pub type Opcode = u8;

pub const OP_HANDSHAKE: Opcode = 0x01;
pub const OP_TRANSPORT_ACK: Opcode = 0x02;
pub const OP_IDENTITY: Opcode = 0x03;
pub const OP_LOOKUP_REQUEST: Opcode = 0x10;
pub const OP_LOOKUP_RESPONSE: Opcode = 0x11;
pub const OP_BROADCAST: Opcode = 0x20;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Signed ephemeral public key; identical shape in both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Handshake {
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

/// Long-term identity proof sent once the transport is sealed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityAnnouncement {
    pub contact: Contact,
    pub proof: IdentityProof,
    /// Signature over `own_ephemeral || peer_ephemeral`.
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupNodeRequest {
    pub request_id: u64,
    pub target: Identity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupNodeResponse {
    pub request_id: u64,
    pub peers: Vec<Contact>,
}

/// Sent directly to every established peer; never relayed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Broadcast {
    /// Random per message; receivers drop ids they have already seen.
    pub message_id: [u8; 16],
    pub payload: Vec<u8>,
}

/// A broadcast handed to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub from: Identity,
    pub payload: Vec<u8>,
}
