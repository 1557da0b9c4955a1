//! # Secure-Session Pipeline
//!
//! Every connection runs an ordered list of [`Stage`]s exactly once, on the
//! task that owns the connection:
//!
//! ```text
//! KeyExchange ──► SecureTransport ──► Identity ──► Established
//! ```
//!
//! A stage receives the peer's half of its exchange through the link's
//! dispatcher (see [`Link::recv`]), which registers a one-shot handler and
//! deregisters it once the message arrives or the wait fails. A stage that
//! fails ends the pipeline; the link is disconnected with the stage's reason
//! and no later stage runs. Retrying is the caller's business (redial).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::{
    diffie_hellman, sign_ephemeral, sign_with_domain, verify_identity_signature, verify_with_domain,
    CipherSuite, CryptoError, KdfHash, SessionCipher, SharedKey, AEAD_KDF_INFO_DIALER, AEAD_KDF_INFO_LISTENER,
    HANDSHAKE_SIGNATURE_DOMAIN, IDENTITY_SIGNATURE_DOMAIN,
};
use crate::identity::{Contact, IdentityProof, Keypair};
use crate::messages::{Handshake, IdentityAnnouncement, OP_HANDSHAKE, OP_IDENTITY, OP_TRANSPORT_ACK};
use crate::transport::{DisconnectReason, Link, Role};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Disconnect(DisconnectReason),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DisconnectReason> for StageError {
    fn from(reason: DisconnectReason) -> Self {
        StageError::Disconnect(reason)
    }
}

impl From<CryptoError> for StageError {
    fn from(err: CryptoError) -> Self {
        StageError::Disconnect(DisconnectReason::Crypto(err))
    }
}

fn violation(what: impl std::fmt::Display) -> StageError {
    StageError::Disconnect(DisconnectReason::ProtocolViolation(what.to_string()))
}

/// The pipeline stopped at `stage`.
#[derive(Debug, Clone, Error)]
#[error("stage `{stage}` disconnected: {reason}")]
pub struct Disconnect {
    pub stage: &'static str,
    pub reason: DisconnectReason,
}

/// Negotiation state accumulated while a connection advances through the
/// pipeline. Owned by the connection's task.
#[derive(Default)]
pub struct SecureSession {
    stage_index: usize,
    ephemeral: Option<SigningKey>,
    local_ephemeral: Option<[u8; 32]>,
    remote_ephemeral: Option<[u8; 32]>,
    shared_key: Option<SharedKey>,
    cipher: Option<Arc<SessionCipher>>,
    inbound_cipher: Option<Arc<SessionCipher>>,
    remote: Option<Contact>,
    remote_proof: Option<IdentityProof>,
}

impl SecureSession {
    /// Index of the running stage, or the stage count once established.
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn is_secured(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher.as_ref().map(|c| c.suite())
    }

    pub fn shared_key(&self) -> Option<&SharedKey> {
        self.shared_key.as_ref()
    }

    /// The authenticated peer, set by [`IdentityStage`].
    pub fn remote(&self) -> Option<&Contact> {
        self.remote.as_ref()
    }

    pub fn remote_proof(&self) -> Option<&IdentityProof> {
        self.remote_proof.as_ref()
    }

    /// `(local, remote)` ephemeral public keys once key exchange completed.
    fn transcript_keys(&self) -> Option<([u8; 32], [u8; 32])> {
        Some((self.local_ephemeral?, self.remote_ephemeral?))
    }
}

/// One step of connection negotiation.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_begin(&self, link: &Link, session: &mut SecureSession) -> Result<(), StageError>;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key exchange, AEAD transport and identity proof, configured from `config`.
    pub fn secure(config: &Config, keypair: Arc<Keypair>, local: Contact, proof: IdentityProof) -> Self {
        Self::new()
            .with_stage(KeyExchangeStage { timeout: config.handshake_timeout })
            .with_stage(SecureTransportStage {
                suite: config.cipher,
                kdf: config.kdf,
                ack_timeout: config.ack_timeout,
            })
            .with_stage(IdentityStage {
                keypair,
                local,
                proof,
                timeout: config.handshake_timeout,
            })
    }

    pub fn with_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order. On failure the link is disconnected and the
    /// failing stage is reported.
    pub async fn run(&self, link: &Link) -> Result<SecureSession, Disconnect> {
        let mut session = SecureSession::default();

        for (index, stage) in self.stages.iter().enumerate() {
            session.stage_index = index;
            let started = Instant::now();

            let result = tokio::select! {
                result = stage.on_begin(link, &mut session) => result,
                reason = link.closed() => Err(StageError::Disconnect(reason)),
            };

            match result {
                Ok(()) => {
                    debug!(
                        peer = %link.remote(),
                        stage = stage.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "stage complete"
                    );
                }
                Err(err) => {
                    let reason = match err {
                        StageError::Disconnect(reason) => reason,
                        StageError::Other(e) => {
                            warn!(peer = %link.remote(), stage = stage.name(), error = %format!("{e:#}"), "stage failed");
                            DisconnectReason::StageFailed(format!("{e:#}"))
                        }
                    };
                    link.disconnect(reason.clone());
                    let reason = link.close_reason().unwrap_or(reason);
                    debug!(peer = %link.remote(), stage = stage.name(), reason = %reason, "pipeline aborted");
                    return Err(Disconnect { stage: stage.name(), reason });
                }
            }
        }

        session.stage_index = self.stages.len();
        Ok(session)
    }
}

/// Signed ephemeral key exchange producing the session's shared secret.
pub struct KeyExchangeStage {
    pub timeout: Duration,
}

#[async_trait]
impl Stage for KeyExchangeStage {
    fn name(&self) -> &'static str {
        "key-exchange"
    }

    async fn on_begin(&self, link: &Link, session: &mut SecureSession) -> Result<(), StageError> {
        let ephemeral = SigningKey::generate(&mut OsRng);
        let public_key = ephemeral.verifying_key().to_bytes();
        let signature = sign_ephemeral(&ephemeral, HANDSHAKE_SIGNATURE_DOMAIN, &public_key);
        session.local_ephemeral = Some(public_key);
        session.ephemeral = Some(ephemeral);

        link.send(OP_HANDSHAKE, &Handshake { public_key, signature }).await?;

        let reply: Handshake = link.recv_message(OP_HANDSHAKE, self.timeout, "handshake").await?;
        verify_with_domain(&reply.public_key, HANDSHAKE_SIGNATURE_DOMAIN, &reply.public_key, &reply.signature)
            .map_err(|e| violation(format!("handshake signature: {e}")))?;

        let ephemeral = session
            .ephemeral
            .take()
            .ok_or_else(|| violation("ephemeral key missing"))?;
        let shared = diffie_hellman(&ephemeral, &reply.public_key)
            .map_err(|e| violation(format!("key exchange: {e}")))?;

        session.remote_ephemeral = Some(reply.public_key);
        session.shared_key = Some(shared);
        Ok(())
    }
}

/// Derives one AEAD cipher per direction and switches the link to them.
///
/// The dialer seals with the dialer key and opens with the listener key; the
/// listener does the reverse.
pub struct SecureTransportStage {
    pub suite: CipherSuite,
    pub kdf: KdfHash,
    pub ack_timeout: Duration,
}

#[async_trait]
impl Stage for SecureTransportStage {
    fn name(&self) -> &'static str {
        "secure-transport"
    }

    async fn on_begin(&self, link: &Link, session: &mut SecureSession) -> Result<(), StageError> {
        let shared = session
            .shared_key
            .as_ref()
            .ok_or_else(|| violation("no shared key negotiated"))?;
        let (outbound_info, inbound_info) = match link.role() {
            Role::Dialer => (AEAD_KDF_INFO_DIALER, AEAD_KDF_INFO_LISTENER),
            Role::Listener => (AEAD_KDF_INFO_LISTENER, AEAD_KDF_INFO_DIALER),
        };
        let outbound = Arc::new(SessionCipher::from_shared(self.suite, self.kdf, shared, outbound_info)?);
        let inbound = Arc::new(SessionCipher::from_shared(self.suite, self.kdf, shared, inbound_info)?);

        link.arm_inbound(inbound.clone());
        link.send_raw(OP_TRANSPORT_ACK, Vec::new()).await?;
        link.recv(OP_TRANSPORT_ACK, self.ack_timeout, "transport ack").await?;
        link.install_outbound(outbound.clone()).await?;

        session.cipher = Some(outbound);
        session.inbound_cipher = Some(inbound);
        Ok(())
    }
}

/// Proves possession of the long-term key over the sealed transport.
pub struct IdentityStage {
    pub keypair: Arc<Keypair>,
    pub local: Contact,
    pub proof: IdentityProof,
    pub timeout: Duration,
}

fn transcript(first: &[u8; 32], second: &[u8; 32]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(first);
    out[32..].copy_from_slice(second);
    out
}

#[async_trait]
impl Stage for IdentityStage {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn on_begin(&self, link: &Link, session: &mut SecureSession) -> Result<(), StageError> {
        if !session.is_secured() {
            return Err(violation("identity exchange requires a secured transport"));
        }
        let (own, peer) = session
            .transcript_keys()
            .ok_or_else(|| violation("no key exchange transcript"))?;

        let announcement = IdentityAnnouncement {
            contact: self.local.clone(),
            proof: self.proof,
            signature: sign_with_domain(&self.keypair, IDENTITY_SIGNATURE_DOMAIN, &transcript(&own, &peer)),
        };
        link.send(OP_IDENTITY, &announcement).await?;

        let reply: IdentityAnnouncement = link.recv_message(OP_IDENTITY, self.timeout, "identity").await?;
        verify_identity_signature(
            &reply.contact.identity,
            IDENTITY_SIGNATURE_DOMAIN,
            &transcript(&peer, &own),
            &reply.signature,
        )
        .map_err(|e| violation(format!("identity signature: {e}")))?;

        if reply.contact.identity == self.local.identity {
            return Err(StageError::Disconnect(DisconnectReason::SelfDial));
        }

        session.remote = Some(reply.contact);
        session.remote_proof = Some(reply.proof);
        Ok(())
    }
}
