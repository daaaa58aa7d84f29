// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded FIFO of typed input events between the EC and the AP.
//!
//! Key presses, button changes, and host events are produced from interrupt
//! and task context and drained by the AP one `get next event` poll at a
//! time. The queue is a fixed ring of `DEPTH` slots with two separate locks:
//! one for the producer cursor (hot: every key press) and one for the
//! consumer cursor (slow: host polling), so a key-scan interrupt never
//! contends with an in-progress host read.
//!
//! # Locking
//!
//! The slot array is shared between the two sides, so safety rests on a
//! protocol rather than a single lock:
//!
//! - The add-lock holder may write the slot at the producer cursor, but only
//!   after checking `entries < DEPTH` under that lock.
//! - The remove-lock holder may read the slot at the consumer cursor, but
//!   only after checking `entries > 0` under that lock.
//! - Whole-queue operations take **both** locks, always add first, then
//!   remove.
//!
//! The cursors are equal exactly when the queue is empty or completely full,
//! and in both of those states one side is excluded by its count check, so
//! the two sides never touch the same slot concurrently.
//!
//! The add path itself can pop: when the dispatch layer reports that the
//! host was not notified (asleep, event not worth waking for) and the new
//! entry is the only one queued, the entry is removed again -- there is no
//! point holding state the host was never told about. That pop acquires the
//! remove lock *while the add lock is held*, which is the one nested
//! acquisition in the crate and the reason the add→remove order is mandatory
//! everywhere. The locks are not reentrant; this is sound because no remove
//! path ever calls back into add.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use ec_proto::{MkbpEventType, MAX_EVENT_PAYLOAD};
use mkbp_event::MkbpSendEvent;
use tracebuf::TraceBuf;

/// One stored event. The payload length is implied by the type and is not
/// stored; see [`MkbpEventType::payload_size`].
#[derive(Copy, Clone)]
struct Entry {
    event_type: u8,
    data: [u8; MAX_EVENT_PAYLOAD],
}

impl Entry {
    const EMPTY: Self = Self {
        event_type: 0,
        data: [0; MAX_EVENT_PAYLOAD],
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trace {
    /// An add was dropped because the queue held `max_depth` entries.
    DepthReached,
    /// A popped slot held an event type that no longer parses.
    CorruptEntry,
}

/// Producer-side state, guarded by the add lock.
struct AddSide {
    /// Next slot to write.
    end: usize,
    trace: TraceBuf<Trace, 4>,
}

/// Consumer-side state, guarded by the remove lock.
struct RemoveSide {
    /// Next slot to read.
    start: usize,
    trace: TraceBuf<Trace, 4>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddError {
    /// The event type does not travel through this FIFO.
    UnsupportedType,
    /// Payload length does not match the type's wire size.
    PayloadSize,
    /// The queue already holds `max_depth` entries; the event was dropped.
    Full,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GetNextError {
    /// Nothing queued.
    Empty,
    /// The head entry is a different event type; the AP must drain types in
    /// queue order. Maps to a BUSY host status, and the queue is unchanged.
    WrongHeadType,
}

/// The event FIFO. `DEPTH` is the physical capacity; the effective ceiling
/// can be lowered at runtime with [`MkbpFifo::set_max_depth`].
pub struct MkbpFifo<const DEPTH: usize> {
    add: spin::Mutex<AddSide>,
    remove: spin::Mutex<RemoveSide>,
    /// Occupancy, readable without either lock.
    entries: AtomicUsize,
    /// Effective capacity ceiling, `<= DEPTH`.
    max_depth: AtomicUsize,
    /// Events dropped on overflow since boot.
    lost: AtomicUsize,
    slots: [UnsafeCell<Entry>; DEPTH],
}

// Safety: the slot array is only touched per the locking protocol described
// in the module docs; everything else is a lock or an atomic.
unsafe impl<const DEPTH: usize> Sync for MkbpFifo<DEPTH> {}

impl<const DEPTH: usize> MkbpFifo<DEPTH> {
    pub const fn new() -> Self {
        const { assert!(DEPTH > 0) };
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY_SLOT: UnsafeCell<Entry> = UnsafeCell::new(Entry::EMPTY);
        Self {
            add: spin::Mutex::new(AddSide {
                end: 0,
                trace: TraceBuf::new(),
            }),
            remove: spin::Mutex::new(RemoveSide {
                start: 0,
                trace: TraceBuf::new(),
            }),
            entries: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(DEPTH),
            lost: AtomicUsize::new(0),
            slots: [EMPTY_SLOT; DEPTH],
        }
    }

    /// Entries currently queued.
    pub fn depth(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    /// Events dropped on overflow since boot.
    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::Relaxed)
    }

    /// Lowers (or restores) the effective capacity. Clamped to the physical
    /// `DEPTH`; storage is never resized. Entries beyond a lowered ceiling
    /// stay queued -- only new adds are refused.
    pub fn set_max_depth(&self, max: usize) {
        self.max_depth.store(max.min(DEPTH), Ordering::Relaxed);
    }

    /// Queues one event and signals the dispatch layer.
    ///
    /// On overflow the event is dropped, the loss counter bumped, and the
    /// caller told -- no blocking, no retry. If the dispatcher reports the
    /// host was not notified and this entry is alone in the queue, the entry
    /// is popped right back out (see module docs).
    pub fn add(
        &self,
        ty: MkbpEventType,
        payload: &[u8],
        now: u32,
        events: &impl MkbpSendEvent,
    ) -> Result<(), AddError> {
        let size = ty.payload_size().ok_or(AddError::UnsupportedType)?;
        if payload.len() != size {
            return Err(AddError::PayloadSize);
        }

        let mut add = self.add.lock();
        if self.entries.load(Ordering::Acquire)
            >= self.max_depth.load(Ordering::Relaxed)
        {
            self.lost.fetch_add(1, Ordering::Relaxed);
            add.trace.record(Trace::DepthReached);
            return Err(AddError::Full);
        }

        let mut entry = Entry::EMPTY;
        entry.event_type = ty as u8;
        entry.data[..size].copy_from_slice(payload);
        // Safety: add lock held and entries < max_depth <= DEPTH, so the
        // consumer cannot reach this slot.
        unsafe {
            *self.slots[add.end].get() = entry;
        }
        add.end = (add.end + 1) % DEPTH;
        self.entries.fetch_add(1, Ordering::Release);

        if !events.send_event(ty, now)
            && self.entries.load(Ordering::Acquire) == 1
        {
            // Host is asleep and was not woken for this; don't queue state
            // it will never hear about. Nested remove-lock acquisition --
            // see module docs.
            let _ = self.pop_head(None);
        }
        Ok(())
    }

    /// Pops the head entry, optionally copying its payload out. Returns the
    /// type and payload length, or `None` if the queue was empty (or the
    /// head slot was corrupt, in which case it is dropped and traced).
    fn pop_head(
        &self,
        out: Option<&mut [u8]>,
    ) -> Option<(MkbpEventType, usize)> {
        let mut rem = self.remove.lock();
        self.pop_head_locked(&mut rem, out)
    }

    fn pop_head_locked(
        &self,
        rem: &mut RemoveSide,
        out: Option<&mut [u8]>,
    ) -> Option<(MkbpEventType, usize)> {
        if self.entries.load(Ordering::Acquire) == 0 {
            return None;
        }
        // Safety: remove lock held and entries > 0, so the producer cannot
        // be writing this slot.
        let entry = unsafe { *self.slots[rem.start].get() };
        rem.start = (rem.start + 1) % DEPTH;
        self.entries.fetch_sub(1, Ordering::Release);

        // Stored types always parse; a failure here means the slot was
        // corrupted. Drop the entry and report empty rather than wedging
        // the queue.
        let ty = match MkbpEventType::from_u8(entry.event_type) {
            Some(ty) => ty,
            None => {
                rem.trace.record(Trace::CorruptEntry);
                return None;
            }
        };
        let size = match ty.payload_size() {
            Some(size) => size,
            None => {
                rem.trace.record(Trace::CorruptEntry);
                return None;
            }
        };
        if let Some(out) = out {
            out[..size].copy_from_slice(&entry.data[..size]);
        }
        Some((ty, size))
    }

    /// The AP-facing pop: succeeds only when the head entry matches the
    /// requested type, enforcing queue-order draining. After a successful
    /// pop, re-signals the dispatcher with the new head's type so the AP
    /// keeps getting told what to ask for next.
    pub fn get_next(
        &self,
        ty: MkbpEventType,
        out: &mut [u8],
        now: u32,
        events: &impl MkbpSendEvent,
    ) -> Result<usize, GetNextError> {
        let mut rem = self.remove.lock();
        if self.entries.load(Ordering::Acquire) == 0 {
            return Err(GetNextError::Empty);
        }
        // Safety: remove lock held, entries > 0.
        let head_type =
            unsafe { (*self.slots[rem.start].get()).event_type };
        if head_type != ty as u8 {
            return Err(GetNextError::WrongHeadType);
        }

        let size = match self.pop_head_locked(&mut rem, Some(out)) {
            Some((_, size)) => size,
            None => return Err(GetNextError::Empty),
        };

        if self.entries.load(Ordering::Acquire) > 0 {
            // Safety: remove lock still held, entries > 0.
            let next_type =
                unsafe { (*self.slots[rem.start].get()).event_type };
            if let Some(next) = MkbpEventType::from_u8(next_type) {
                events.send_event(next, now);
            }
        }
        Ok(size)
    }

    /// Removes only key-matrix entries, keeping every other entry in its
    /// original relative order with its bytes untouched. Used when the AP
    /// asks for the keyboard state to be flushed (e.g. across a lid close)
    /// without losing button or host events.
    pub fn clear_keyboard(&self) {
        // Both locks, fixed order.
        let mut add = self.add.lock();
        let mut rem = self.remove.lock();

        let count = self.entries.load(Ordering::Acquire);
        let start = rem.start;
        let mut kept = 0;
        for i in 0..count {
            let src = (start + i) % DEPTH;
            // Safety: both locks held; no other access is possible.
            let entry = unsafe { *self.slots[src].get() };
            if entry.event_type == MkbpEventType::KeyMatrix as u8 {
                continue;
            }
            let dst = (start + kept) % DEPTH;
            if dst != src {
                unsafe {
                    *self.slots[dst].get() = entry;
                }
            }
            kept += 1;
        }
        add.end = (start + kept) % DEPTH;
        rem.start = start;
        self.entries.store(kept, Ordering::Release);
    }

    /// Empties the queue entirely.
    pub fn clear(&self) {
        // Both locks, fixed order.
        let mut add = self.add.lock();
        let mut rem = self.remove.lock();
        add.end = 0;
        rem.start = 0;
        self.entries.store(0, Ordering::Release);
    }
}

impl<const DEPTH: usize> Default for MkbpFifo<DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}
