//! # Link RPC
//!
//! Lookup and broadcast exchanges carried over established links. Both run
//! through the link's dispatcher like the session stages do:
//!
//! - `LookupNodeRequest` is served by a persistent handler per link that
//!   answers from the routing table
//! - `LookupNodeResponse` is matched to its request by `request_id`; each
//!   outstanding request owns a handler that deregisters itself on a match
//! - `Broadcast` is deduplicated by message id and forwarded to the inbox
//!
//! A payload that does not decode is a protocol violation and closes the link.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::dht::DhtNode;
use crate::dispatch::{CallbackError, HandlerId};
use crate::identity::{Contact, Identity};
use crate::messages::{
    Broadcast, LookupNodeRequest, LookupNodeResponse, Message, OP_BROADCAST, OP_LOOKUP_REQUEST,
    OP_LOOKUP_RESPONSE,
};
use crate::protocols::LookupRpc;
use crate::transport::{Delivery, DisconnectReason, Link, LinkSender};

/// Broadcast ids remembered for deduplication.
pub(crate) type SeenBroadcasts = Arc<Mutex<LruCache<[u8; 16], ()>>>;

fn decode_or_close<T: serde::de::DeserializeOwned>(
    sender: &LinkSender,
    delivery: &Delivery,
) -> Result<T, CallbackError> {
    delivery.decode().map_err(|e| {
        sender.close(DisconnectReason::ProtocolViolation(format!("{e:#}")));
        CallbackError::Failed(e)
    })
}

/// Deregisters a pending response handler when the request is dropped,
/// whether it completed, failed or was cancelled by a timeout.
struct PendingResponse {
    link: Link,
    handler: HandlerId,
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.link.deregister(OP_LOOKUP_RESPONSE, self.handler);
    }
}

/// Send a lookup to the peer on `link` and wait for the matching response.
///
/// The response is truncated to `max_peers`. The caller bounds the wait.
pub(crate) async fn request_lookup(
    link: &Link,
    request_id: u64,
    target: Identity,
    max_peers: usize,
) -> Result<Vec<Contact>> {
    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    let sender = link.sender();

    let handler = link.register(OP_LOOKUP_RESPONSE, move |delivery: &Delivery| {
        let response: LookupNodeResponse = decode_or_close(&sender, delivery)?;
        if response.request_id != request_id {
            return Ok(());
        }
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(response.peers);
        }
        Err(CallbackError::Deregister)
    });
    let _pending = PendingResponse { link: link.clone(), handler };

    link.send(OP_LOOKUP_REQUEST, &LookupNodeRequest { request_id, target }).await?;

    let mut peers = tokio::select! {
        peers = rx => peers.map_err(|_| anyhow!("lookup response handler dropped"))?,
        reason = link.closed() => return Err(anyhow!("link closed during lookup: {reason}")),
    };
    if peers.len() > max_peers {
        debug!(peer = %link.remote(), returned = peers.len(), max = max_peers, "truncating oversized lookup response");
        peers.truncate(max_peers);
    }
    Ok(peers)
}

/// Answer lookup requests arriving from `from` on `link`.
pub(crate) fn serve_lookups<N: LookupRpc>(link: &Link, from: Identity, dht: DhtNode<N>) -> HandlerId {
    let sender = link.sender();
    link.register(OP_LOOKUP_REQUEST, move |delivery: &Delivery| {
        let request: LookupNodeRequest = decode_or_close(&sender, delivery)?;
        let peers = dht.handle_lookup_request(&from, request.target);
        trace!(peer = %from, returned = peers.len(), "serving lookup");

        let sender = sender.clone();
        let response = LookupNodeResponse { request_id: request.request_id, peers };
        tokio::spawn(async move {
            if let Err(e) = sender.send(OP_LOOKUP_RESPONSE, &response).await {
                debug!(peer = %from, error = %e, "failed to send lookup response");
            }
        });
        Ok(())
    })
}

/// Deliver broadcasts arriving from `from` on `link` to `inbox`.
pub(crate) fn serve_broadcasts(
    link: &Link,
    from: Identity,
    inbox: mpsc::Sender<Message>,
    seen: SeenBroadcasts,
) -> HandlerId {
    let sender = link.sender();
    link.register(OP_BROADCAST, move |delivery: &Delivery| {
        let broadcast: Broadcast = decode_or_close(&sender, delivery)?;
        if seen.lock().put(broadcast.message_id, ()).is_some() {
            trace!(peer = %from, "duplicate broadcast dropped");
            return Ok(());
        }

        match inbox.try_send(Message { from, payload: broadcast.payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %from, "inbox full, dropping broadcast");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
        Ok(())
    })
}
