//! # Opcode Callback Dispatcher
//!
//! Maps a one-byte opcode to an ordered list of handlers. Inbound frames on a
//! connection are delivered by calling [`Dispatcher::run`] with the frame's
//! opcode; whichever session stage or protocol handler is registered for it
//! receives the payload.
//!
//! ## Concurrency
//!
//! Each opcode has its own slot holding an `Arc<Vec<_>>` behind a lock.
//! `run` clones the `Arc` (a snapshot) and iterates without holding the lock,
//! so registrations during a run never affect the in-flight iteration and a
//! run on one opcode never waits on another opcode's compaction.
//!
//! Removal is lazy: an entry is flagged *pending removal* and skipped by every
//! subsequent run. Once `compact_threshold` flags accumulate on an opcode its
//! list is rebuilt without them.
//!
//! ## Handler results
//!
//! - `Ok(())` keeps the handler registered
//! - `Err(CallbackError::Deregister)` removes it without reporting an error
//! - `Err(CallbackError::Failed(_))` removes it and reports the error

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::config::DEFAULT_COMPACT_THRESHOLD;
use crate::messages::Opcode;

const OPCODE_SPACE: usize = 256;

#[derive(Debug, Error)]
pub enum CallbackError {
    /// Sentinel: the handler is done and wants to be removed.
    #[error("handler deregistered")]
    Deregister,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type CallbackResult = Result<(), CallbackError>;

/// A callback invoked with each message delivered on its opcode.
pub trait Handler<A>: Send + Sync + 'static {
    fn call(&self, args: &A) -> CallbackResult;
}

impl<A, F> Handler<A> for F
where
    F: Fn(&A) -> CallbackResult + Send + Sync + 'static,
{
    fn call(&self, args: &A) -> CallbackResult {
        self(args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry<A> {
    id: HandlerId,
    handler: Box<dyn Handler<A>>,
    removed: AtomicBool,
}

impl<A> Entry<A> {
    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Returns true if this call performed the transition.
    fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }
}

struct Slot<A> {
    entries: RwLock<Arc<Vec<Arc<Entry<A>>>>>,
    pending: AtomicUsize,
}

impl<A> Slot<A> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            pending: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Entry<A>>>> {
        self.entries.read().clone()
    }
}

/// Outcome of a single [`Dispatcher::run_counted`].
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Handlers actually invoked (entries pending removal are not counted).
    pub invoked: usize,
    pub errors: Vec<anyhow::Error>,
}

pub struct Dispatcher<A> {
    slots: Vec<Slot<A>>,
    next_id: AtomicU64,
    compact_threshold: usize,
    reverse: bool,
}

impl<A: 'static> Default for Dispatcher<A> {
    fn default() -> Self {
        Self::new(DEFAULT_COMPACT_THRESHOLD, false)
    }
}

impl<A: 'static> Dispatcher<A> {
    pub fn new(compact_threshold: usize, reverse: bool) -> Self {
        Self {
            slots: (0..OPCODE_SPACE).map(|_| Slot::new()).collect(),
            next_id: AtomicU64::new(1),
            compact_threshold: compact_threshold.max(1),
            reverse,
        }
    }

    fn slot(&self, opcode: Opcode) -> &Slot<A> {
        &self.slots[opcode as usize]
    }

    /// Append a handler to `opcode`'s list.
    pub fn register<H: Handler<A>>(&self, opcode: Opcode, handler: H) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(Entry {
            id,
            handler: Box::new(handler),
            removed: AtomicBool::new(false),
        });

        let slot = self.slot(opcode);
        let mut guard = slot.entries.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(entry);
        *guard = Arc::new(next);
        id
    }

    /// Mark a handler pending removal. Returns false if it was already gone.
    pub fn deregister(&self, opcode: Opcode, id: HandlerId) -> bool {
        let slot = self.slot(opcode);
        let removed = slot
            .snapshot()
            .iter()
            .find(|entry| entry.id == id)
            .is_some_and(|entry| entry.mark_removed());
        if removed {
            self.note_removal(opcode);
        }
        removed
    }

    /// Number of live (not pending-removal) handlers on `opcode`.
    pub fn handler_count(&self, opcode: Opcode) -> usize {
        self.slot(opcode)
            .snapshot()
            .iter()
            .filter(|entry| !entry.is_removed())
            .count()
    }

    /// Invoke every live handler for `opcode` and collect their failures.
    pub fn run(&self, opcode: Opcode, args: &A) -> Vec<anyhow::Error> {
        self.run_counted(opcode, args).errors
    }

    pub fn run_counted(&self, opcode: Opcode, args: &A) -> Dispatch {
        let snapshot = self.slot(opcode).snapshot();
        let mut outcome = Dispatch::default();

        let ordered: Box<dyn Iterator<Item = &Arc<Entry<A>>>> = if self.reverse {
            Box::new(snapshot.iter().rev())
        } else {
            Box::new(snapshot.iter())
        };

        for entry in ordered {
            if entry.is_removed() {
                continue;
            }
            outcome.invoked += 1;
            match entry.handler.call(args) {
                Ok(()) => {}
                Err(CallbackError::Deregister) => {
                    if entry.mark_removed() {
                        self.note_removal(opcode);
                    }
                }
                Err(CallbackError::Failed(err)) => {
                    if entry.mark_removed() {
                        self.note_removal(opcode);
                    }
                    outcome.errors.push(err.context(format!("opcode {opcode:#04x} handler failed")));
                }
            }
        }
        outcome
    }

    fn note_removal(&self, opcode: Opcode) {
        let slot = self.slot(opcode);
        let pending = slot.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending >= self.compact_threshold {
            self.compact(opcode);
        }
    }

    /// Drop entries pending removal from `opcode`'s list.
    pub fn compact(&self, opcode: Opcode) {
        let slot = self.slot(opcode);
        let mut guard = slot.entries.write();
        if guard.iter().any(|entry| entry.is_removed()) {
            let live: Vec<_> = guard.iter().filter(|e| !e.is_removed()).cloned().collect();
            *guard = Arc::new(live);
        }
        slot.pending.store(0, Ordering::Release);
    }

    /// Total entries in `opcode`'s list, including those pending removal.
    #[cfg(test)]
    fn raw_len(&self, opcode: Opcode) -> usize {
        self.slot(opcode).snapshot().len()
    }
}
