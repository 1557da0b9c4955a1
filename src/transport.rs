//! # Connection Layer
//!
//! Each live connection is driven by two tasks and exposed through a cheap,
//! cloneable [`Link`] handle.
//!
//! ```text
//!   Link::send ──► mpsc ──► writer task ──[seal]──► socket
//!                                                      │
//!   Dispatcher ◄── backlog ◄──[open]── reader task ◄───┘
//! ```
//!
//! ## Framing
//!
//! Every frame is a `u32` little-endian length followed by the body. The body
//! is an opcode byte plus a bincode payload; once a cipher is installed the
//! whole body is sealed, so the opcode is not visible on the wire.
//!
//! ## Interceptors
//!
//! The writer owns the outbound cipher and its nonce counter; installing it
//! is a command on the same queue as frames, so everything queued before the
//! install goes out in plaintext. The reader activates the inbound cipher
//! immediately after the peer's plaintext transport ACK. If the ACK arrives
//! before the local side armed its cipher the reader parks until it does.
//!
//! ## Teardown
//!
//! [`Link::disconnect`] records a [`DisconnectReason`] in a `watch` channel.
//! Only the first reason sticks. Both tasks and every pending [`Link::recv`]
//! observe the change and return.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::crypto::{CryptoError, NonceCounter, SessionCipher};
use crate::dispatch::{CallbackError, Dispatcher, Handler, HandlerId};
use crate::messages::{self, Opcode, MAX_FRAME_SIZE, OP_TRANSPORT_ACK};

/// Poly1305 / GCM tag appended by every supported cipher.
const AEAD_TAG_LEN: usize = 16;

/// Frames queued for the writer before `send` applies backpressure.
const OUTBOUND_QUEUE: usize = 256;

/// Frames parked per connection while no handler is registered for them.
const MAX_BACKLOG: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("aead failure: {0}")]
    Crypto(#[from] CryptoError),
    #[error("transport closed")]
    TransportClosed,
    #[error("closed by local request")]
    LocalRequest,
    #[error("connected to self")]
    SelfDial,
    #[error("rejected by admission policy")]
    Rejected,
    #[error("superseded by another link to the same peer")]
    Superseded,
    #[error("stage failed: {0}")]
    StageFailed(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

impl From<FrameError> for DisconnectReason {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(_) => DisconnectReason::TransportClosed,
            FrameError::TooLarge(len) => {
                DisconnectReason::ProtocolViolation(format!("oversized frame ({len} bytes)"))
            }
        }
    }
}

/// Read one length-prefixed frame body.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one length-prefixed frame body and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

/// An inbound frame handed to dispatcher handlers.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        messages::deserialize_bounded(&self.payload)
            .map_err(|e| anyhow!("malformed payload for opcode {:#04x}: {e}", self.opcode))
    }
}

enum WriterCommand {
    Frame { opcode: Opcode, payload: Vec<u8> },
    InstallCipher(Arc<SessionCipher>),
}

#[derive(Clone)]
struct Closer(Arc<watch::Sender<Option<DisconnectReason>>>);

impl Closer {
    /// Record `reason` if nothing was recorded yet. Returns true on the first call.
    fn close(&self, reason: DisconnectReason) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    fn reason(&self) -> Option<DisconnectReason> {
        self.0.borrow().clone()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<Option<DisconnectReason>>) -> DisconnectReason {
    match rx.wait_for(|reason| reason.is_some()).await {
        Ok(reason) => reason.clone().unwrap_or(DisconnectReason::TransportClosed),
        Err(_) => DisconnectReason::TransportClosed,
    }
}

/// Outbound half of a [`Link`].
///
/// Handlers registered on a link capture this rather than the link itself,
/// which would otherwise keep its own dispatcher alive.
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<WriterCommand>,
    closer: Closer,
}

impl LinkSender {
    pub async fn send<T: Serialize>(&self, opcode: Opcode, message: &T) -> Result<()> {
        let payload = messages::serialize(message)?;
        self.send_raw(opcode, payload).await
    }

    pub async fn send_raw(&self, opcode: Opcode, payload: Vec<u8>) -> Result<()> {
        if let Some(reason) = self.closer.reason() {
            bail!("link closed: {reason}");
        }
        if 1 + payload.len() + AEAD_TAG_LEN > MAX_FRAME_SIZE {
            bail!("payload of {} bytes exceeds frame limit", payload.len());
        }
        self.tx
            .send(WriterCommand::Frame { opcode, payload })
            .await
            .map_err(|_| anyhow!("link closed"))
    }

    /// Tear the link down from inside a handler.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        self.closer.close(reason)
    }
}

#[derive(Default)]
struct Backlog {
    frames: VecDeque<Delivery>,
}

impl Backlog {
    fn push(&mut self, delivery: Delivery) {
        if self.frames.len() >= MAX_BACKLOG
            && let Some(dropped) = self.frames.pop_front()
        {
            debug!(opcode = dropped.opcode, "backlog full, dropping oldest frame");
        }
        self.frames.push_back(delivery);
    }

    fn take(&mut self, opcode: Opcode) -> Option<Delivery> {
        let index = self.frames.iter().position(|d| d.opcode == opcode)?;
        self.frames.remove(index)
    }

    fn drain(&mut self, opcode: Opcode) -> Vec<Delivery> {
        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            self.frames.drain(..).partition(|d| d.opcode == opcode);
        self.frames = rest;
        matching.into()
    }
}

struct LinkInner {
    role: Role,
    remote: String,
    sender: LinkSender,
    dispatcher: Dispatcher<Delivery>,
    backlog: Mutex<Backlog>,
    inbound_arm: watch::Sender<Option<Arc<SessionCipher>>>,
}

impl LinkInner {
    /// Run handlers for an inbound frame, parking it if nobody consumed it.
    fn deliver(&self, delivery: Delivery) {
        let mut backlog = self.backlog.lock();
        let outcome = self.dispatcher.run_counted(delivery.opcode, &delivery);
        for err in outcome.errors {
            warn!(peer = %self.remote, opcode = delivery.opcode, error = %format!("{err:#}"), "handler failed");
        }
        if outcome.invoked == 0 {
            trace!(peer = %self.remote, opcode = delivery.opcode, "no handler, frame parked");
            backlog.push(delivery);
        }
    }
}

/// Handle to one live connection.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("remote", &self.inner.remote)
            .field("role", &self.inner.role)
            .field("closed", &self.close_reason())
            .finish()
    }
}

impl Link {
    /// Take ownership of `stream` and start its reader and writer tasks.
    pub fn spawn<S>(stream: S, role: Role, remote: impl Into<String>, config: &Config) -> Link
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed_tx, _) = watch::channel(None);
        let (arm_tx, arm_rx) = watch::channel(None);
        let closer = Closer(Arc::new(closed_tx));

        let link = Link {
            inner: Arc::new(LinkInner {
                role,
                remote: remote.into(),
                sender: LinkSender { tx, closer: closer.clone() },
                dispatcher: Dispatcher::new(config.compact_threshold, config.reverse_dispatch),
                backlog: Mutex::new(Backlog::default()),
                inbound_arm: arm_tx,
            }),
        };

        tokio::spawn(write_loop(write_half, rx, closer, link.inner.remote.clone()));
        tokio::spawn(read_loop(read_half, link.inner.clone(), arm_rx));
        link
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    /// True if both handles drive the same connection.
    pub fn same_link(&self, other: &Link) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn sender(&self) -> LinkSender {
        self.inner.sender.clone()
    }

    pub async fn send<T: Serialize>(&self, opcode: Opcode, message: &T) -> Result<()> {
        self.inner.sender.send(opcode, message).await
    }

    pub async fn send_raw(&self, opcode: Opcode, payload: Vec<u8>) -> Result<()> {
        self.inner.sender.send_raw(opcode, payload).await
    }

    /// Register a persistent handler and replay any frames already parked
    /// for its opcode.
    pub fn register<H: Handler<Delivery>>(&self, opcode: Opcode, handler: H) -> HandlerId {
        let mut backlog = self.inner.backlog.lock();
        let id = self.inner.dispatcher.register(opcode, handler);
        for delivery in backlog.drain(opcode) {
            for err in self.inner.dispatcher.run(opcode, &delivery) {
                warn!(peer = %self.inner.remote, opcode, error = %format!("{err:#}"), "handler failed");
            }
        }
        id
    }

    pub fn deregister(&self, opcode: Opcode, id: HandlerId) -> bool {
        self.inner.dispatcher.deregister(opcode, id)
    }

    /// Wait for the next frame on `opcode`.
    ///
    /// Consumes a parked frame if one exists; otherwise registers a one-shot
    /// handler that forwards the payload and deregisters itself. Fails on
    /// timeout or teardown, never blocks past either.
    pub async fn recv(&self, opcode: Opcode, timeout: Duration, what: &'static str) -> Result<Vec<u8>, DisconnectReason> {
        let mut closed = self.inner.sender.closer.0.subscribe();
        if let Some(reason) = closed.borrow().clone() {
            return Err(reason);
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut backlog = self.inner.backlog.lock();
            if let Some(delivery) = backlog.take(opcode) {
                return Ok(delivery.payload);
            }
            let slot = Mutex::new(Some(tx));
            self.inner.dispatcher.register(opcode, move |delivery: &Delivery| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(delivery.payload.clone());
                }
                Err(CallbackError::Deregister)
            })
        };

        tokio::select! {
            payload = rx => payload.map_err(|_| DisconnectReason::TransportClosed),
            _ = tokio::time::sleep(timeout) => {
                self.inner.dispatcher.deregister(opcode, id);
                Err(DisconnectReason::Timeout(what))
            }
            reason = wait_closed(&mut closed) => {
                self.inner.dispatcher.deregister(opcode, id);
                Err(reason)
            }
        }
    }

    /// Like [`Link::recv`], decoding the payload.
    pub async fn recv_message<T: DeserializeOwned>(
        &self,
        opcode: Opcode,
        timeout: Duration,
        what: &'static str,
    ) -> Result<T, DisconnectReason> {
        let payload = self.recv(opcode, timeout, what).await?;
        messages::deserialize_bounded(&payload)
            .map_err(|e| DisconnectReason::ProtocolViolation(format!("malformed {what}: {e}")))
    }

    /// Open inbound frames with `cipher` from the frame after the peer's ACK.
    pub fn arm_inbound(&self, cipher: Arc<SessionCipher>) {
        self.inner.inbound_arm.send_replace(Some(cipher));
    }

    /// Seal every frame queued after this call with `cipher`.
    pub async fn install_outbound(&self, cipher: Arc<SessionCipher>) -> Result<()> {
        self.inner
            .sender
            .tx
            .send(WriterCommand::InstallCipher(cipher))
            .await
            .map_err(|_| anyhow!("link closed"))
    }

    /// Tear the connection down. Idempotent: returns false and keeps the
    /// original reason if already closed.
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        let first = self.inner.sender.closer.close(reason.clone());
        if first {
            debug!(peer = %self.inner.remote, reason = %reason, "disconnecting");
        }
        first
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.inner.sender.closer.reason()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Resolves once the link is torn down.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self.inner.sender.closer.0.subscribe();
        wait_closed(&mut rx).await
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriterCommand>,
    closer: Closer,
    remote: String,
) {
    let mut closed = closer.0.subscribe();
    let mut outbound: Option<(Arc<SessionCipher>, NonceCounter)> = None;

    loop {
        let command = tokio::select! {
            command = rx.recv() => command,
            _ = wait_closed(&mut closed) => break,
        };
        let Some(command) = command else { break };

        match command {
            WriterCommand::InstallCipher(cipher) => {
                trace!(peer = %remote, suite = %cipher.suite(), "outbound cipher installed");
                outbound = Some((cipher, NonceCounter::new()));
            }
            WriterCommand::Frame { opcode, payload } => {
                let mut body = Vec::with_capacity(1 + payload.len());
                body.push(opcode);
                body.extend_from_slice(&payload);

                if let Some((cipher, counter)) = outbound.as_mut() {
                    let sealed = counter.next().and_then(|nonce| cipher.seal(nonce, &body));
                    match sealed {
                        Ok(ciphertext) => body = ciphertext,
                        Err(e) => {
                            closer.close(DisconnectReason::Crypto(e));
                            break;
                        }
                    }
                }

                if let Err(e) = write_frame(&mut writer, &body).await {
                    debug!(peer = %remote, error = %e, "write failed");
                    closer.close(e.into());
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    link: Arc<LinkInner>,
    mut arm: watch::Receiver<Option<Arc<SessionCipher>>>,
) {
    let closer = link.sender.closer.clone();
    let mut closed = closer.0.subscribe();
    let mut inbound: Option<(Arc<SessionCipher>, NonceCounter)> = None;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = wait_closed(&mut closed) => break,
        };
        let body = match frame {
            Ok(body) => body,
            Err(e) => {
                debug!(peer = %link.remote, error = %e, "read failed");
                closer.close(e.into());
                break;
            }
        };

        let body = match inbound.as_mut() {
            Some((cipher, counter)) => {
                match counter.next().and_then(|nonce| cipher.open(nonce, &body)) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!(peer = %link.remote, error = %e, "inbound frame rejected");
                        closer.close(DisconnectReason::Crypto(e));
                        break;
                    }
                }
            }
            None => body,
        };

        let Some((&opcode, payload)) = body.split_first() else {
            closer.close(DisconnectReason::ProtocolViolation("empty frame".into()));
            break;
        };
        let plaintext_ack = inbound.is_none() && opcode == OP_TRANSPORT_ACK;
        link.deliver(Delivery { opcode, payload: payload.to_vec() });

        if plaintext_ack {
            let armed = tokio::select! {
                armed = arm.wait_for(|cipher| cipher.is_some()) => {
                    armed.ok().and_then(|cipher| cipher.clone())
                }
                _ = wait_closed(&mut closed) => break,
            };
            let Some(cipher) = armed else { break };
            trace!(peer = %link.remote, suite = %cipher.suite(), "inbound cipher active");
            inbound = Some((cipher, NonceCounter::new()));
        }
    }
}

/// Two links joined by an in-memory pipe.
#[cfg(test)]
pub(crate) fn link_pair(config: &Config) -> (Link, Link) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Link::spawn(a, Role::Dialer, "pipe-a", config),
        Link::spawn(b, Role::Listener, "pipe-b", config),
    )
}
