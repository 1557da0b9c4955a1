//! # Cryptographic Infrastructure
//!
//! - **Signatures**: domain-separated Ed25519 signing and strict verification
//! - **Key exchange**: X25519 computed over the Montgomery form of ephemeral
//!   Ed25519 keys, so one ephemeral keypair both signs and agrees
//! - **KDF**: HKDF with SHA-256 or SHA-512, no salt
//! - **AEAD**: AES-256-GCM, ChaCha20-Poly1305 or XChaCha20-Poly1305
//!
//! ## Nonces
//!
//! Session ciphers never pick their own nonces. Each direction of a
//! connection owns a [`NonceCounter`] that starts at zero and increments by
//! one per message; the counter is encoded big-endian into the trailing eight
//! bytes of an otherwise zeroed nonce. Reusing a nonce under the same key
//! breaks both confidentiality and integrity, so the only way to obtain a
//! nonce is [`NonceCounter::next`], which fails once the space is exhausted
//! instead of wrapping.

use std::fmt;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Sha256, Sha512};
use thiserror::Error;
use zeroize::Zeroize;

use crate::identity::{Identity, Keypair};

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("peer public key is not a valid curve point")]
    InvalidPublicKey,
    #[error("key exchange produced an all-zero shared secret")]
    WeakSharedSecret,
    #[error("key derivation failed")]
    Kdf,
    #[error("invalid key length for {0}")]
    InvalidKeyLength(CipherSuite),
    #[error("aead seal failed")]
    Seal,
    #[error("aead open failed (nonce {nonce})")]
    Open { nonce: u64 },
    #[error("nonce counter exhausted")]
    NonceExhausted,
}

// Domain separation prefixes. Each signed context gets its own prefix so a
// signature produced for one purpose is never valid for another.

/// Fixed context signed by ephemeral keys during key exchange.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"kadlink-handshake-v1:";

/// Context for the long-term key's signature over the handshake transcript.
pub const IDENTITY_SIGNATURE_DOMAIN: &[u8] = b"kadlink-identity-v1:";

/// HKDF info for frames sent by the side that dialed.
pub const AEAD_KDF_INFO_DIALER: &[u8] = b"kadlink-aead-v1:dialer";

/// HKDF info for frames sent by the side that accepted.
pub const AEAD_KDF_INFO_LISTENER: &[u8] = b"kadlink-aead-v1:listener";

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + data.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

/// Sign data with domain separation using a long-term keypair.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Sign data with domain separation using a bare (ephemeral) signing key.
pub fn sign_ephemeral(key: &SigningKey, domain: &[u8], data: &[u8]) -> Vec<u8> {
    key.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Verify a domain-separated signature against a raw 32-byte public key.
///
/// Uses `verify_strict`, rejecting small-order keys and malleable signatures.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(&prefixed(domain, data), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Verify a domain-separated signature produced by an identity's key.
pub fn verify_identity_signature(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    verify_with_domain(identity.as_bytes(), domain, data, signature)
}

/// Shared secret produced by the key exchange. Zeroed on drop.
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// X25519 between our ephemeral Ed25519 secret and the peer's ephemeral
/// Ed25519 public key, both mapped to Curve25519.
pub fn diffie_hellman(local: &SigningKey, remote_public: &[u8; 32]) -> Result<SharedKey, CryptoError> {
    let remote = VerifyingKey::from_bytes(remote_public).map_err(|_| CryptoError::InvalidPublicKey)?;
    let mut scalar = local.to_scalar_bytes();
    let secret = x25519_dalek::x25519(scalar, remote.to_montgomery().to_bytes());
    scalar.zeroize();

    if secret.iter().all(|&b| b == 0) {
        return Err(CryptoError::WeakSharedSecret);
    }
    Ok(SharedKey(secret))
}

/// Hash function driving HKDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KdfHash {
    #[default]
    Sha256,
    Sha512,
}

impl KdfHash {
    /// Derive a 32-byte key from `ikm` with no salt.
    pub fn derive_key(self, ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut okm = [0u8; 32];
        match self {
            KdfHash::Sha256 => Hkdf::<Sha256>::new(None, ikm)
                .expand(info, &mut okm)
                .map_err(|_| CryptoError::Kdf)?,
            KdfHash::Sha512 => Hkdf::<Sha512>::new(None, ikm)
                .expand(info, &mut okm)
                .map_err(|_| CryptoError::Kdf)?,
        }
        Ok(okm)
    }
}

impl fmt::Display for KdfHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KdfHash::Sha256 => f.write_str("sha256"),
            KdfHash::Sha512 => f.write_str("sha512"),
        }
    }
}

impl FromStr for KdfHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(KdfHash::Sha256),
            "sha512" | "sha-512" => Ok(KdfHash::Sha512),
            other => anyhow::bail!("unknown kdf hash '{other}' (expected sha256 or sha512)"),
        }
    }
}

/// AEAD algorithm used once the transport is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherSuite {
    Aes256Gcm,
    #[default]
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl CipherSuite {
    pub const ALL: [CipherSuite; 3] = [
        CipherSuite::Aes256Gcm,
        CipherSuite::ChaCha20Poly1305,
        CipherSuite::XChaCha20Poly1305,
    ];
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherSuite::Aes256Gcm => f.write_str("aes-256-gcm"),
            CipherSuite::ChaCha20Poly1305 => f.write_str("chacha20-poly1305"),
            CipherSuite::XChaCha20Poly1305 => f.write_str("xchacha20-poly1305"),
        }
    }
}

impl FromStr for CipherSuite {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(CipherSuite::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(CipherSuite::ChaCha20Poly1305),
            "xchacha20-poly1305" | "xchacha20poly1305" => Ok(CipherSuite::XChaCha20Poly1305),
            other => anyhow::bail!("unknown cipher '{other}'"),
        }
    }
}

/// Symmetric AEAD keyed from the session's shared secret.
///
/// Stateless with respect to nonces; callers supply counter values from a
/// [`NonceCounter`] owned by exactly one direction of a connection.
pub enum SessionCipher {
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

impl SessionCipher {
    pub fn new(suite: CipherSuite, key: &[u8; 32]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength(suite);
        Ok(match suite {
            CipherSuite::Aes256Gcm => {
                SessionCipher::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?))
            }
            CipherSuite::ChaCha20Poly1305 => {
                SessionCipher::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?)
            }
            CipherSuite::XChaCha20Poly1305 => {
                SessionCipher::XChaCha20Poly1305(XChaCha20Poly1305::new_from_slice(key).map_err(invalid)?)
            }
        })
    }

    /// Derive one direction's key from `shared` and construct the cipher.
    ///
    /// Each direction must use its own `info` so the two counters never
    /// seal under the same key.
    pub fn from_shared(suite: CipherSuite, kdf: KdfHash, shared: &SharedKey, info: &[u8]) -> Result<Self, CryptoError> {
        let mut key = kdf.derive_key(shared.as_bytes(), info)?;
        let cipher = Self::new(suite, &key);
        key.zeroize();
        cipher
    }

    pub fn suite(&self) -> CipherSuite {
        match self {
            SessionCipher::Aes256Gcm(_) => CipherSuite::Aes256Gcm,
            SessionCipher::ChaCha20Poly1305(_) => CipherSuite::ChaCha20Poly1305,
            SessionCipher::XChaCha20Poly1305(_) => CipherSuite::XChaCha20Poly1305,
        }
    }

    pub fn seal(&self, nonce: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            SessionCipher::Aes256Gcm(cipher) => {
                let n = counter_nonce::<12>(nonce);
                cipher.encrypt(aes_gcm::Nonce::from_slice(&n), plaintext)
            }
            SessionCipher::ChaCha20Poly1305(cipher) => {
                let n = counter_nonce::<12>(nonce);
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(&n), plaintext)
            }
            SessionCipher::XChaCha20Poly1305(cipher) => {
                let n = counter_nonce::<24>(nonce);
                cipher.encrypt(chacha20poly1305::XNonce::from_slice(&n), plaintext)
            }
        }
        .map_err(|_| CryptoError::Seal)
    }

    pub fn open(&self, nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            SessionCipher::Aes256Gcm(cipher) => {
                let n = counter_nonce::<12>(nonce);
                cipher.decrypt(aes_gcm::Nonce::from_slice(&n), ciphertext)
            }
            SessionCipher::ChaCha20Poly1305(cipher) => {
                let n = counter_nonce::<12>(nonce);
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(&n), ciphertext)
            }
            SessionCipher::XChaCha20Poly1305(cipher) => {
                let n = counter_nonce::<24>(nonce);
                cipher.decrypt(chacha20poly1305::XNonce::from_slice(&n), ciphertext)
            }
        }
        .map_err(|_| CryptoError::Open { nonce })
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionCipher({})", self.suite())
    }
}

fn counter_nonce<const N: usize>(counter: u64) -> [u8; N] {
    let mut nonce = [0u8; N];
    nonce[N - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Per-direction message counter. Never resets, never wraps.
#[derive(Debug, Default)]
pub struct NonceCounter {
    next: u64,
    exhausted: bool,
}

impl NonceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current counter value and advance by exactly one.
    pub fn next(&mut self) -> Result<u64, CryptoError> {
        if self.exhausted {
            return Err(CryptoError::NonceExhausted);
        }
        let current = self.next;
        match self.next.checked_add(1) {
            Some(n) => self.next = n,
            None => self.exhausted = true,
        }
        Ok(current)
    }

    #[cfg(test)]
    fn starting_at(next: u64) -> Self {
        Self { next, exhausted: false }
    }
}
