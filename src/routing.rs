//! # Routing Table
//!
//! Kademlia routing table: 256 buckets indexed by the length of the common
//! prefix between a peer's identity and ours. Each bucket holds up to `K`
//! contacts, most recently seen first, behind its own lock so that updates
//! to unrelated buckets never contend.
//!
//! When a bucket is full the least recently seen contact is evicted in
//! favour of the newcomer. Contacts only enter the table after the session
//! pipeline has authenticated them, so the newcomer is always live.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::identity::{distance_cmp, Contact, Identity, IDENTITY_LEN};

const NUM_BUCKETS: usize = IDENTITY_LEN * 8;

/// Result of [`RoutingTable::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    /// Already present; moved to the front.
    Refreshed,
    /// Bucket was full; the returned contact was dropped to make room.
    Evicted(Contact),
    /// The contact was our own identity.
    Ignored,
}

#[derive(Debug, Default)]
struct Bucket {
    contacts: VecDeque<Contact>,
}

impl Bucket {
    /// Move `contact` to the front. A known contact keeps its stored
    /// address unless `replace_addr` is set.
    fn touch(&mut self, contact: Contact, k: usize, replace_addr: bool) -> UpdateOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.identity == contact.identity) {
            if let Some(mut existing) = self.contacts.remove(pos) {
                if replace_addr {
                    existing.addr = contact.addr;
                }
                self.contacts.push_front(existing);
            }
            return UpdateOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push_front(contact);
            return UpdateOutcome::Inserted;
        }

        let evicted = self.contacts.pop_back();
        self.contacts.push_front(contact);
        match evicted {
            Some(evicted) => UpdateOutcome::Evicted(evicted),
            None => UpdateOutcome::Inserted,
        }
    }

    fn remove(&mut self, id: &Identity) -> bool {
        match self.contacts.iter().position(|c| &c.identity == id) {
            Some(pos) => {
                self.contacts.remove(pos);
                true
            }
            None => false,
        }
    }

    fn get(&self, id: &Identity) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.identity == id)
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: Identity,
    k: usize,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(self_id: Identity, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| RwLock::new(Bucket::default())).collect();
        Self {
            self_id,
            k: k.max(1),
            buckets,
        }
    }

    pub fn self_id(&self) -> Identity {
        self.self_id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    /// Bucket holding `id`: the common prefix length with our identity.
    /// Our own identity maps to the last bucket but is never stored.
    pub fn bucket_index(&self, id: &Identity) -> usize {
        self.self_id.prefix_len(id).min(NUM_BUCKETS - 1)
    }

    /// Mark `contact` as seen. A contact already in the table keeps the
    /// address it was stored with.
    pub fn update(&self, contact: Contact) -> UpdateOutcome {
        self.touch(contact, false)
    }

    /// Mark `contact` as seen and record its address. Only for contacts whose
    /// address the peer itself announced over an authenticated session.
    pub fn update_authenticated(&self, contact: Contact) -> UpdateOutcome {
        self.touch(contact, true)
    }

    fn touch(&self, contact: Contact, replace_addr: bool) -> UpdateOutcome {
        if contact.identity == self.self_id {
            return UpdateOutcome::Ignored;
        }
        let idx = self.bucket_index(&contact.identity);
        self.buckets[idx].write().touch(contact, self.k, replace_addr)
    }

    pub fn remove(&self, id: &Identity) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = self.bucket_index(id);
        self.buckets[idx].write().remove(id)
    }

    pub fn exists(&self, id: &Identity) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &Identity) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        let idx = self.bucket_index(id);
        self.buckets[idx].read().get(id).cloned()
    }

    /// Up to `count` contacts ordered by XOR distance to `target`.
    ///
    /// Starts at the bucket `target` falls into and expands outward. Every
    /// bucket above it is at the same top distance bit, so that side is taken
    /// whole; buckets below are strictly farther the lower they go and are
    /// added one at a time until enough candidates are collected.
    pub fn closest_peers(&self, target: &Identity, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let start = self.bucket_index(target);
        let mut candidates: Vec<Contact> = Vec::with_capacity(count + self.k);
        for bucket in &self.buckets[start..] {
            candidates.extend(bucket.read().contacts.iter().cloned());
        }
        for bucket in self.buckets[..start].iter().rev() {
            if candidates.len() >= count {
                break;
            }
            candidates.extend(bucket.read().contacts.iter().cloned());
        }

        candidates.sort_by(|a, b| distance_cmp(&a.distance_to(target), &b.distance_to(target)));
        candidates.truncate(count);
        candidates
    }

    /// Snapshot of every contact, bucket by bucket.
    pub fn all_peers(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.read().contacts.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(bucket index, occupancy)` for every non-empty bucket.
    pub fn bucket_sizes(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(idx, bucket)| {
                let len = bucket.read().contacts.len();
                (len > 0).then_some((idx, len))
            })
            .collect()
    }
}
