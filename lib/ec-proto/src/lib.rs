// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol types shared between the EC event cores and the host boundary.
//!
//! This crate is the moral equivalent of `ec_commands.h`: every type here is
//! part of a contract with the AP and must not change layout or numbering
//! without a protocol version bump. The event cores (`mkbp-fifo`,
//! `mkbp-event`, `motion-fifo`, `fp-core`) all speak in these types; nothing
//! in this crate holds state or takes locks.

#![cfg_attr(not(test), no_std)]

pub mod fp;
pub mod sensor;
pub mod time;

/// Number of columns in the key matrix payload, and therefore the size of a
/// `KeyMatrix` event. Boards with narrower matrices still send this many
/// bytes; the host masks off the columns it knows about.
pub const KEYBOARD_COLS_MAX: usize = 13;

/// Largest payload the keyboard event FIFO can carry (the key matrix).
pub const MAX_EVENT_PAYLOAD: usize = KEYBOARD_COLS_MAX;

/// MKBP event types, numbered as on the wire.
///
/// The numbering is shared with the AP's `get next event` command: the first
/// response byte is one of these values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MkbpEventType {
    /// One scan of the key matrix.
    KeyMatrix = 0,
    /// 32-bit host event mask.
    HostEvent = 1,
    /// Motion sensor FIFO info follows.
    SensorFifo = 2,
    /// Power/volume button state change.
    Button = 3,
    /// Lid/tablet switch state change.
    Switch = 4,
    /// Fingerprint event word is pending.
    Fingerprint = 5,
    /// Sysrq key sequence.
    Sysrq = 6,
    /// 64-bit host event mask.
    HostEvent64 = 7,
}

/// Count of defined event types; bounds the round-robin scan and the event
/// bitmask width.
pub const MKBP_EVENT_TYPE_COUNT: usize = 8;

/// Set in the event-type byte of a `get next event` response (protocol
/// version 2+) when more events remain queued after this one.
pub const MKBP_HAS_MORE_EVENTS: u8 = 1 << 7;

impl MkbpEventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::KeyMatrix,
            1 => Self::HostEvent,
            2 => Self::SensorFifo,
            3 => Self::Button,
            4 => Self::Switch,
            5 => Self::Fingerprint,
            6 => Self::Sysrq,
            7 => Self::HostEvent64,
            _ => return None,
        })
    }

    /// Payload size for event types that travel through the keyboard event
    /// FIFO. Types whose data lives in their own subsystem (sensor FIFO,
    /// fingerprint) return `None` and are rejected by the FIFO.
    pub fn payload_size(self) -> Option<usize> {
        match self {
            Self::KeyMatrix => Some(KEYBOARD_COLS_MAX),
            Self::HostEvent | Self::Button | Self::Switch | Self::Sysrq => {
                Some(4)
            }
            Self::HostEvent64 => Some(8),
            Self::SensorFifo | Self::Fingerprint => None,
        }
    }
}

/// Bitmask of pending MKBP event types, one bit per [`MkbpEventType`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_raw(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn single(ty: MkbpEventType) -> Self {
        Self(1 << ty as u8)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, ty: MkbpEventType) -> bool {
        self.0 & (1 << ty as u8) != 0
    }

    pub fn insert(&mut self, ty: MkbpEventType) {
        self.0 |= 1 << ty as u8;
    }

    pub fn union(&mut self, other: EventMask) {
        self.0 |= other.0;
    }

    /// Clears `ty`'s bit, returning whether it was set. This is the
    /// "take event if set" primitive of the dispatcher's round-robin.
    pub fn take(&mut self, ty: MkbpEventType) -> bool {
        let bit = 1 << ty as u8;
        let taken = self.0 & bit != 0;
        self.0 &= !bit;
        taken
    }
}
