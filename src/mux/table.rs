//! Connection table.
//!
//! Maps each client to its decoder handle. Backed by a sharded
//! [`DashMap`], so unrelated clients never contend on one lock, and no
//! shard guard is ever held across an `.await`.
//!
//! # Slot States
//!
//! ```text
//!  (absent) ──reserve──► Pending(ticket) ──commit──► Ready(handle)
//!     ▲                        │                          │
//!     └────── release/remove ──┘──────── remove ──────────┘
//! ```
//!
//! A pending slot belongs to a connect whose decoder factory is still
//! running. Receive only ever sees ready slots.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxBuildHasher;
use tokio::sync::{Mutex, MutexGuard};

use crate::decoder::Decoder;
use crate::error::Result;
use crate::identifiers::ClientId;

// ============================================================================
// DecoderHandle
// ============================================================================

/// One client's decoder plus its teardown state.
///
/// The decoder mutex serializes feeds for this client only. `closed` is
/// shared with the decoder's message subscription so that nothing is
/// emitted once teardown has run.
pub(crate) struct DecoderHandle<D> {
    decoder: Mutex<D>,
    closed: Arc<AtomicBool>,
}

impl<D: Decoder> DecoderHandle<D> {
    pub(crate) fn new(decoder: D, closed: Arc<AtomicBool>) -> Self {
        Self {
            decoder: Mutex::new(decoder),
            closed,
        }
    }

    /// Feeds bytes unless the handle is closed.
    ///
    /// Returns `Ok(false)` when the bytes were dropped.
    pub(crate) async fn feed(&self, data: &[u8]) -> Result<bool> {
        let mut decoder = self.decoder.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }

        decoder.feed(data).await?;
        Ok(true)
    }

    /// Locks the decoder without feeding it.
    ///
    /// Feeds and closes wait until the guard is dropped.
    pub(crate) async fn hold(&self) -> MutexGuard<'_, D> {
        self.decoder.lock().await
    }

    /// Closes the handle and runs the teardown hook.
    ///
    /// Returns `false` if the handle was already closed.
    pub(crate) async fn close(&self) -> bool {
        let mut decoder = self.decoder.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        decoder.teardown();
        true
    }
}

// ============================================================================
// Slot
// ============================================================================

/// Table entry for one client.
pub(crate) enum Slot<D> {
    /// Connect in progress, identified by its reservation ticket.
    Pending(u64),
    /// Handshake completed.
    Ready(Arc<DecoderHandle<D>>),
}

// ============================================================================
// ConnectionTable
// ============================================================================

/// Concurrent client → decoder mapping.
pub(crate) struct ConnectionTable<D> {
    slots: DashMap<ClientId, Slot<D>, FxBuildHasher>,
    next_ticket: AtomicU64,
}

impl<D: Decoder> ConnectionTable<D> {
    pub(crate) fn new() -> Self {
        Self {
            slots: DashMap::with_hasher(FxBuildHasher),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Reserves the slot for `client_id`.
    ///
    /// Returns `None` if the client already has a pending or ready slot.
    pub(crate) fn reserve(&self, client_id: ClientId) -> Option<Reservation<'_, D>> {
        match self.slots.entry(client_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot::Pending(ticket));
                Some(Reservation {
                    table: self,
                    client_id,
                    ticket,
                    armed: true,
                })
            }
        }
    }

    /// Returns the ready handle for `client_id`, if any.
    pub(crate) fn lookup(&self, client_id: ClientId) -> Option<Arc<DecoderHandle<D>>> {
        match self.slots.get(&client_id).as_deref() {
            Some(Slot::Ready(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Removes and returns whatever slot `client_id` holds.
    pub(crate) fn remove(&self, client_id: ClientId) -> Option<Slot<D>> {
        self.slots.remove(&client_id).map(|(_, slot)| slot)
    }

    /// Returns `true` if `client_id` has completed its handshake.
    pub(crate) fn is_ready(&self, client_id: ClientId) -> bool {
        matches!(self.slots.get(&client_id).as_deref(), Some(Slot::Ready(_)))
    }

    /// Number of ready entries.
    pub(crate) fn ready_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .count()
    }

    /// Identifiers of ready entries.
    pub(crate) fn ready_ids(&self) -> Vec<ClientId> {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Identifiers of all entries, pending included.
    pub(crate) fn all_ids(&self) -> Vec<ClientId> {
        self.slots.iter().map(|entry| *entry.key()).collect()
    }

    /// Drops the pending slot if it still carries `ticket`.
    fn release(&self, client_id: ClientId, ticket: u64) {
        self.slots
            .remove_if(&client_id, |_, slot| matches!(slot, Slot::Pending(t) if *t == ticket));
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// Provisional claim on a client's slot.
///
/// Dropping an uncommitted reservation releases the slot, so a cancelled or
/// failed connect leaves no trace in the table.
pub(crate) struct Reservation<'a, D: Decoder> {
    table: &'a ConnectionTable<D>,
    client_id: ClientId,
    ticket: u64,
    armed: bool,
}

impl<D: Decoder> Reservation<'_, D> {
    /// Promotes the pending slot to ready.
    ///
    /// Fails, handing the handle back, if the slot was removed or replaced
    /// while the reservation was outstanding.
    pub(crate) fn commit(
        mut self,
        handle: Arc<DecoderHandle<D>>,
    ) -> std::result::Result<(), Arc<DecoderHandle<D>>> {
        self.armed = false;

        match self.table.slots.get_mut(&self.client_id) {
            Some(mut slot) if matches!(*slot, Slot::Pending(t) if t == self.ticket) => {
                *slot = Slot::Ready(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }
}

impl<D: Decoder> Drop for Reservation<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.table.release(self.client_id, self.ticket);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
