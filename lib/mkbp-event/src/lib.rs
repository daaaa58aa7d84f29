// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MKBP event dispatch.
//!
//! Every asynchronous event the EC can raise -- key matrix scans, sensor FIFO
//! watermarks, fingerprint results -- funnels through one notification line
//! to the AP and one `get next event` host command. This crate owns that
//! funnel: the bitmask of pending event types, the state machine for the
//! EC→AP interrupt edge, and the round-robin walk over registered event
//! sources when the AP polls.
//!
//! The interrupt edge is not a simple boolean. Raising it may go through a
//! host communication layer that can fail or be overtaken by a concurrent
//! raise, so the state tracks an explicit transition with an id; only the
//! most recent transition gets to decide the final state. A deferred retry
//! (driven by the embedding calling [`MkbpDispatch::poll_deferred`]) covers
//! both "the raise failed" and "the AP never answered".
//!
//! Producers hand the dispatcher a type bit via [`MkbpSendEvent`]; the data
//! itself stays in the producer until the AP polls, at which point the
//! registered [`EventSource`] for the winning type serializes it.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, Ordering};

use ec_proto::time::time_after;
use ec_proto::{EventMask, MkbpEventType, MKBP_EVENT_TYPE_COUNT, MKBP_HAS_MORE_EVENTS};

/// Microseconds before the deferred safety-net retry fires.
const RETRY_DELAY_US: u32 = 1_000_000;
/// Consecutive unanswered raises before we give up on the current event.
const MAX_FAILED_ATTEMPTS: u8 = 3;

/// Producer-facing seam: "an event of this type is now pending".
///
/// Returns true if the AP has been, or is about to be, notified. A false
/// return means the notification was skipped (host asleep, event not in the
/// wake mask) or the transport failed; producers of non-critical state may
/// react by not queuing data the AP will never hear about.
pub trait MkbpSendEvent {
    fn send_event(&self, ty: MkbpEventType, now: u32) -> bool;
}

/// The EC→AP notification transport (GPIO line, host event, HECI...).
pub trait HostLink {
    /// Drives the notification. `active == false` must be trivially cheap
    /// (GPIO write or no-op) -- it is called with the dispatch lock held.
    /// When `timestamp` is given, it is written as close to the hardware
    /// edge as the transport can manage.
    fn set_active(
        &self,
        active: bool,
        timestamp: Option<&mut u32>,
    ) -> Result<(), HostLinkError>;

    /// Whether the AP is in a sleep state where non-wake events should not
    /// raise the line.
    fn is_sleeping(&self) -> bool;
}

/// The transport could not raise the notification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostLinkError;

/// One registered event source, looked up by type when the AP polls.
pub struct EventSource<'a> {
    pub event_type: MkbpEventType,
    /// Serializes the source's pending data into the response body (after
    /// the type byte). `Busy` means "my head-of-queue is a different type;
    /// re-queue me and serve that type first".
    pub get_data: &'a (dyn Fn(&mut [u8]) -> Result<usize, GetDataError> + Sync),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GetDataError {
    /// The source's next record is of a different event type.
    Busy,
    /// The source failed outright; surfaced to the AP as an error status.
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// No events pending; the interrupt line has been deactivated.
    Unavailable,
    /// An event bit was set for a type with no registered source.
    UnknownSource,
    /// The winning source's `get_data` failed.
    SourceFailed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum InterruptState {
    /// Line low; only valid while no events are pending (or the host is
    /// asleep and nothing queued is worth waking it for).
    Inactive,
    /// A rising edge is being sent through the transport.
    Transitioning,
    /// Edge sent; waiting for the AP to drain events.
    Active,
}

struct DispatchState {
    events: EventMask,
    interrupt: InterruptState,
    /// Id of the most recent Inactive→Active transition; an older
    /// in-flight transition observing a newer id must not touch the state.
    interrupt_id: u8,
    failed_attempts: u8,
    /// Round-robin cursor so no event type starves.
    last: u8,
    /// Deadline for the deferred retry, when armed.
    retry_deadline: Option<u32>,
}

/// The dispatcher. One per EC; producers share it by reference.
pub struct MkbpDispatch<H: HostLink> {
    state: spin::Mutex<DispatchState>,
    host: H,
    /// Event types allowed to wake a sleeping AP. Defaults to all.
    wake_mask: AtomicU32,
    /// Time the most recent rising edge was sent, for host-side latency
    /// accounting (readable by event sources, e.g. the sensor FIFO info).
    last_event_time: AtomicU32,
}

impl<H: HostLink> MkbpDispatch<H> {
    pub fn new(host: H) -> Self {
        Self {
            state: spin::Mutex::new(DispatchState {
                events: EventMask::EMPTY,
                interrupt: InterruptState::Inactive,
                interrupt_id: 0,
                failed_attempts: 0,
                last: 0,
                retry_deadline: None,
            }),
            host,
            wake_mask: AtomicU32::new(u32::MAX),
            last_event_time: AtomicU32::new(0),
        }
    }

    pub fn wake_mask(&self) -> u32 {
        self.wake_mask.load(Ordering::Relaxed)
    }

    pub fn set_wake_mask(&self, mask: u32) {
        self.wake_mask.store(mask, Ordering::Relaxed);
    }

    pub fn last_event_time(&self) -> u32 {
        self.last_event_time.load(Ordering::Relaxed)
    }

    /// Ors `events_to_add` into the pending set and drives the interrupt
    /// edge. Returns true if the AP is (or is being) notified.
    pub fn activate(&self, events_to_add: EventMask, now: u32) -> bool {
        // Decide whether this event is worth waking a sleeping AP.
        let mut skip_interrupt = self.host.is_sleeping()
            && events_to_add.raw() & self.wake_mask.load(Ordering::Relaxed)
                == 0;

        let transition_id = {
            let mut st = self.state.lock();
            st.events.union(events_to_add);

            // Never leave the AP unaware of key presses, asleep or not.
            skip_interrupt = skip_interrupt
                && !st.events.contains(MkbpEventType::KeyMatrix);

            if !st.events.is_empty()
                && st.interrupt == InterruptState::Inactive
                && !skip_interrupt
            {
                st.interrupt = InterruptState::Transitioning;
                st.interrupt_id = st.interrupt_id.wrapping_add(1);
                st.interrupt_id
            } else {
                // No edge to send; report whether one is already in flight.
                return st.interrupt != InterruptState::Inactive;
            }
        };

        // Send the rising edge outside the lock; the transport may be slow.
        let mut edge_time = 0;
        let rv = self.host.set_active(true, Some(&mut edge_time));
        if rv.is_ok() {
            self.last_event_time.store(edge_time, Ordering::Relaxed);
        }

        let mut st = self.state.lock();
        if st.interrupt == InterruptState::Transitioning
            && st.interrupt_id == transition_id
        {
            // We are the latest transition, so we decide the outcome and we
            // arm the safety net: if the raise failed, the retry re-raises;
            // if it succeeded but the AP never polls, the retry toggles.
            st.interrupt = if rv.is_ok() {
                InterruptState::Active
            } else {
                InterruptState::Inactive
            };
            st.retry_deadline = Some(now.wrapping_add(RETRY_DELAY_US));
        }
        st.interrupt != InterruptState::Inactive
    }

    /// Deferred safety net; the embedding calls this from its timer loop.
    /// Cheap no-op until the armed deadline passes.
    pub fn poll_deferred(&self, now: u32) {
        let resend = {
            let mut st = self.state.lock();
            match st.retry_deadline {
                Some(deadline) if time_after(now, deadline) => {}
                _ => return,
            }
            st.retry_deadline = None;

            match st.interrupt {
                // The raise failed earlier; try again without limit.
                InterruptState::Inactive => true,
                // Raise went out but the AP never polled. Drop back to
                // inactive so a fresh edge can be generated, up to the
                // attempt limit; past it, stop nagging about the current
                // event but leave future events a clean slate.
                InterruptState::Active => {
                    st.interrupt = InterruptState::Inactive;
                    st.failed_attempts += 1;
                    if st.failed_attempts < MAX_FAILED_ATTEMPTS {
                        true
                    } else {
                        st.failed_attempts = 0;
                        false
                    }
                }
                InterruptState::Transitioning => false,
            }
        };

        if resend {
            self.activate(EventMask::EMPTY, now);
        }
    }

    /// Clears the interrupt if no events remain. Returns true if it did.
    fn set_inactive_if_no_events(&self) -> bool {
        let mut st = self.state.lock();
        let clear = st.events.is_empty();
        if clear {
            st.interrupt = InterruptState::Inactive;
            st.failed_attempts = 0;
            st.retry_deadline = None;
            // Deactivation must be trivial; see HostLink::set_active.
            let _ = self.host.set_active(false, None);
        }
        clear
    }

    /// The AP's `get next event` poll.
    ///
    /// Scans pending types round-robin from the cursor, serializes the
    /// winner into `resp` (`resp[0]` = type byte, data after), and returns
    /// the total response length. A `Busy` source gets its bit back and the
    /// scan moves on -- the AP must drain that source's queue in its own
    /// order. Version 2+ responses flag remaining events in the type byte.
    pub fn get_next_event(
        &self,
        sources: &[EventSource<'_>],
        resp: &mut [u8],
        version: u8,
    ) -> Result<usize, DispatchError> {
        let data_size;
        loop {
            let evt = {
                let mut st = self.state.lock();
                let mut found = None;
                for i in 0..MKBP_EVENT_TYPE_COUNT as u8 {
                    let raw = (st.last + i) % MKBP_EVENT_TYPE_COUNT as u8;
                    // The mask only ever holds bits for defined types.
                    let ty = match MkbpEventType::from_u8(raw) {
                        Some(ty) => ty,
                        None => continue,
                    };
                    if st.events.take(ty) {
                        found = Some(ty);
                        st.last =
                            (raw + 1) % MKBP_EVENT_TYPE_COUNT as u8;
                        break;
                    }
                }
                found
            };

            let evt = match evt {
                Some(evt) => evt,
                None => {
                    if self.set_inactive_if_no_events() {
                        return Err(DispatchError::Unavailable);
                    }
                    // An event arrived between the scan and the check;
                    // restart the scan.
                    continue;
                }
            };

            let src = sources
                .iter()
                .find(|s| s.event_type == evt)
                .ok_or(DispatchError::UnknownSource)?;

            resp[0] = evt as u8;
            match (src.get_data)(&mut resp[1..]) {
                Ok(n) => {
                    data_size = n;
                    break;
                }
                Err(GetDataError::Busy) => {
                    // The source's head is another type; put the bit back
                    // and let the scan find the type actually at its head.
                    self.state.lock().events.insert(evt);
                }
                Err(GetDataError::Failed) => {
                    return Err(DispatchError::SourceFailed);
                }
            }
        }

        if !self.set_inactive_if_no_events() && version >= 2 {
            resp[0] |= MKBP_HAS_MORE_EVENTS;
        }
        Ok(1 + data_size)
    }

    /// Test/reset support: drop all pending events and lower the line.
    pub fn clear_all(&self) {
        let mut st = self.state.lock();
        st.events = EventMask::EMPTY;
        st.interrupt = InterruptState::Inactive;
        st.failed_attempts = 0;
        st.retry_deadline = None;
        let _ = self.host.set_active(false, None);
    }
}

impl<H: HostLink> MkbpSendEvent for MkbpDispatch<H> {
    fn send_event(&self, ty: MkbpEventType, now: u32) -> bool {
        self.activate(EventMask::single(ty), now)
    }
}
