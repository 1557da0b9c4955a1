//! Protocol trait definitions.
//!
//! The lookup engine in [`crate::dht`] depends only on [`LookupRpc`], not on
//! the connection layer. The node implements it over secured links; tests
//! implement it over an in-memory registry of engines.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Contact, Identity};

/// Remote side of an iterative lookup.
#[async_trait]
pub trait LookupRpc: Send + Sync + 'static {
    /// Ask `to` for the contacts it knows closest to `target`.
    async fn lookup_node(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>>;
}
