//! # Identities and Contacts
//!
//! - [`Keypair`]: long-term Ed25519 signing keypair
//! - [`Identity`]: 32-byte Ed25519 public key, the peer's identifier and its
//!   position in the XOR metric space
//! - [`Contact`]: an identity paired with the address it can be dialed at
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 public key.** Possession of the private key is proven
//! during the identity stage of the session pipeline, so the routing table
//! only ever holds contacts whose key ownership has been demonstrated on a
//! live connection.
//!
//! ## Proof-of-Work (S/Kademlia)
//!
//! Deployments that want Sybil resistance can require
//! `BLAKE3(domain || public_key || nonce)` to have a number of leading zero
//! bits before a peer is admitted to the routing table. The check is an
//! [`AdmissionPolicy`]; [`PowAdmission`] implements it and a difficulty of
//! zero admits everyone.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Length in bytes of an identity (and therefore of an XOR distance).
pub const IDENTITY_LEN: usize = 32;

/// Maximum nonce value tried per keypair before regenerating the keypair.
const POW_MAX_NONCE: u64 = 1 << 36;

/// Maximum keypair regeneration attempts during PoW generation.
const POW_MAX_KEYPAIR_ATTEMPTS: u32 = 16;

/// Domain separation prefix for PoW hashing.
const POW_HASH_DOMAIN: &[u8] = b"kadlink-pow-v1:";

/// Error type for Proof-of-Work generation failures.
///
/// Only reachable with a broken CSPRNG or an unreasonable difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoWError {
    pub keypairs_tried: u32,
    pub nonces_per_keypair: u64,
    pub difficulty: u32,
}

impl std::fmt::Display for PoWError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PoW generation failed after {} keypairs with {} nonces each (difficulty={})",
            self.keypairs_tried, self.nonces_per_keypair, self.difficulty
        )
    }
}

impl std::error::Error for PoWError {}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a keypair without any proof-of-work.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Generate a keypair whose identity satisfies `difficulty` leading zero
    /// bits, returning the proof alongside it.
    ///
    /// A difficulty of zero returns immediately with an empty proof.
    pub fn generate_with_pow_difficulty(difficulty: u32) -> Result<(Self, IdentityProof), PoWError> {
        if difficulty == 0 {
            return Ok((Self::generate(), IdentityProof::empty()));
        }

        for _ in 0..POW_MAX_KEYPAIR_ATTEMPTS {
            let signing_key = SigningKey::generate(&mut OsRng);
            let public_key = signing_key.verifying_key().to_bytes();

            for nonce in 0..POW_MAX_NONCE {
                if verify_pow_hash(&public_key, nonce, difficulty) {
                    return Ok((Self { signing_key }, IdentityProof { nonce }));
                }
            }
        }
        Err(PoWError {
            keypairs_tried: POW_MAX_KEYPAIR_ATTEMPTS,
            nonces_per_keypair: POW_MAX_NONCE,
            difficulty,
        })
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; IDENTITY_LEN] {
        let mut out = [0u8; IDENTITY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading zero bits of the XOR distance to `other`.
    ///
    /// Symmetric in its arguments. Identical identities yield `256`.
    #[inline]
    pub fn prefix_len(&self, other: &Identity) -> usize {
        count_leading_zeros(&self.xor_distance(other)) as usize
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Reject trivially invalid identities and non-points on the curve.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    #[inline]
    pub fn verify_pow_with_difficulty(&self, proof: &IdentityProof, difficulty: u32) -> bool {
        verify_pow_hash(&self.0, proof.nonce, difficulty)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; IDENTITY_LEN]> for Identity {
    fn from(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Nonce that, hashed with the public key, meets the PoW difficulty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IdentityProof {
    pub nonce: u64,
}

impl IdentityProof {
    pub fn empty() -> Self {
        Self { nonce: 0 }
    }

    /// Search for a nonce satisfying `difficulty` for an existing identity.
    ///
    /// Returns `None` if the nonce space is exhausted.
    pub fn compute_for_identity(identity: &Identity, difficulty: u32) -> Option<Self> {
        (0..POW_MAX_NONCE)
            .find(|&nonce| verify_pow_hash(identity.as_bytes(), nonce, difficulty))
            .map(|nonce| Self { nonce })
    }
}

#[inline]
fn verify_pow_hash(public_key: &[u8; IDENTITY_LEN], nonce: u64, difficulty: u32) -> bool {
    let mut hasher = blake3::Hasher::new();
    hasher.update(POW_HASH_DOMAIN);
    hasher.update(public_key);
    hasher.update(&nonce.to_le_bytes());
    count_leading_zeros(hasher.finalize().as_bytes()) >= difficulty
}

#[inline]
fn count_leading_zeros(bytes: &[u8; IDENTITY_LEN]) -> u32 {
    let mut zeros = 0u32;
    for byte in bytes {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// Compare two XOR distances lexicographically (big-endian magnitude).
#[inline]
pub fn distance_cmp(a: &[u8; IDENTITY_LEN], b: &[u8; IDENTITY_LEN]) -> Ordering {
    a.cmp(b)
}

/// A dialable peer: identity plus advertised address.
///
/// Equality, ordering and hashing consider only the identity, so two records
/// for the same key with different addresses collapse to one peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addr: String,
}

impl Contact {
    pub fn new(identity: Identity, addr: impl Into<String>) -> Self {
        Self {
            identity,
            addr: addr.into(),
        }
    }

    #[inline]
    pub fn distance_to(&self, target: &Identity) -> [u8; IDENTITY_LEN] {
        self.identity.xor_distance(target)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl PartialOrd for Contact {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Contact {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity.cmp(&other.identity)
    }
}

/// Predicate evaluated on an authenticated peer before it enters the
/// routing table.
pub trait AdmissionPolicy: Send + Sync + 'static {
    fn admit(&self, contact: &Contact, proof: &IdentityProof) -> bool;
}

/// Admits every authenticated peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AdmissionPolicy for AcceptAll {
    fn admit(&self, _contact: &Contact, _proof: &IdentityProof) -> bool {
        true
    }
}

/// S/Kademlia-style static puzzle: the identity's PoW hash must carry at
/// least `difficulty` leading zero bits.
#[derive(Debug, Clone, Copy)]
pub struct PowAdmission {
    pub difficulty: u32,
}

impl AdmissionPolicy for PowAdmission {
    fn admit(&self, contact: &Contact, proof: &IdentityProof) -> bool {
        contact.identity.is_valid()
            && contact.identity.verify_pow_with_difficulty(proof, self.difficulty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_equals_public_key() {
        for _ in 0..50 {
            let kp = Keypair::generate();
            assert_eq!(*kp.identity().as_bytes(), kp.public_key_bytes());
        }
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = Keypair::generate().identity();
        let b = Keypair::generate().identity();

        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
    }

    #[test]
    fn prefix_len_is_symmetric_and_deterministic() {
        for _ in 0..100 {
            let a = Keypair::generate().identity();
            let b = Keypair::generate().identity();
            assert_eq!(a.prefix_len(&b), b.prefix_len(&a));
            assert_eq!(a.prefix_len(&b), a.prefix_len(&b));
        }
    }

    #[test]
    fn prefix_len_counts_leading_zero_bits() {
        let zero = Identity::from_bytes([0u8; 32]);

        let mut top = [0u8; 32];
        top[0] = 0x80;
        assert_eq!(zero.prefix_len(&Identity::from_bytes(top)), 0);

        let mut ninth = [0u8; 32];
        ninth[1] = 0x40;
        assert_eq!(zero.prefix_len(&Identity::from_bytes(ninth)), 9);

        assert_eq!(zero.prefix_len(&zero), 256);
    }

    #[test]
    fn distance_cmp_orders_lexicographically() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[0] = 1;
        b[1] = 0xFF;
        assert_eq!(distance_cmp(&b, &a), Ordering::Less);
        assert_eq!(distance_cmp(&a, &a), Ordering::Equal);
    }

    #[test]
    fn contact_equality_ignores_address() {
        let id = Keypair::generate().identity();
        let a = Contact::new(id, "10.0.0.1:1000");
        let b = Contact::new(id, "10.0.0.2:2000");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn hex_roundtrip_and_rejects_bad_lengths() {
        let id = Keypair::generate().identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).expect("decode"), id);
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn signature_unforgeability() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"important message");

        assert!(keypair.verify(b"important message", &signature));
        assert!(!keypair.verify(b"modified message", &signature));
        assert!(!Keypair::generate().verify(b"important message", &signature));
    }

    #[test]
    fn pow_generation_satisfies_difficulty() {
        let (kp, proof) = Keypair::generate_with_pow_difficulty(8).expect("pow");
        assert!(kp.identity().verify_pow_with_difficulty(&proof, 8));

        let policy = PowAdmission { difficulty: 8 };
        let contact = Contact::new(kp.identity(), "127.0.0.1:1");
        assert!(policy.admit(&contact, &proof));
    }

    #[test]
    fn pow_admission_rejects_missing_proof() {
        let policy = PowAdmission { difficulty: 16 };
        // Nonce 0 meeting 16 bits for a random key has probability 2^-16.
        let rejected = (0..4)
            .map(|_| Contact::new(Keypair::generate().identity(), "127.0.0.1:1"))
            .filter(|c| !policy.admit(c, &IdentityProof::empty()))
            .count();
        assert!(rejected >= 3);
    }

    #[test]
    fn compute_for_identity_finds_valid_nonce() {
        let id = Keypair::generate().identity();
        let proof = IdentityProof::compute_for_identity(&id, 6).expect("nonce found");
        assert!(id.verify_pow_with_difficulty(&proof, 6));
    }

    #[test]
    fn keypair_reconstruction_preserves_identity() {
        let original = Keypair::generate();
        let rebuilt = Keypair::from_secret_key_bytes(&original.secret_key_bytes());
        assert_eq!(original.identity(), rebuilt.identity());
        assert_eq!(original.sign(b"m").to_bytes(), rebuilt.sign(b"m").to_bytes());
    }

    #[test]
    fn all_zero_identity_is_invalid() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
        assert!(Keypair::generate().identity().is_valid());
    }
}
